//! Human-readable run summary

use crate::engine::pool::PoolReport;
use crate::error::EngineError;
use crate::stats::PoolSnapshot;
use crate::util::time::{calculate_rate, format_duration, format_rate};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::Duration;

/// Render the end-of-run summary
///
/// Every pool that has counters is listed, whether it finished, failed or
/// was cancelled.
pub fn render(
    elapsed: Duration,
    reports: &[PoolReport],
    failure: Option<&EngineError>,
    counters: &BTreeMap<String, PoolSnapshot>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "═══════════════════════════════════════════════════════════");
    let _ = writeln!(out, "                      RUN SUMMARY");
    let _ = writeln!(out, "═══════════════════════════════════════════════════════════");
    let _ = writeln!(out, "Elapsed Time: {}", format_duration(elapsed));
    let _ = writeln!(out);

    for (id, snap) in counters {
        let report = reports.iter().find(|r| &r.id == id);
        let failed = failure.and_then(|f| f.failures.iter().find(|(pool, _)| pool == id));
        let status = match (report, failed) {
            (_, Some((_, err))) => format!("FAILED: {}", err),
            (Some(_), None) => "done".to_string(),
            (None, None) => "cancelled".to_string(),
        };
        let pool_elapsed = report.map(|r| r.elapsed).unwrap_or(elapsed);

        let _ = writeln!(out, "Pool {} ({})", id, status);
        let _ = writeln!(
            out,
            "  Shots:     {} - {} rps",
            snap.shots_fired,
            format_rate(calculate_rate(snap.shots_fired, pool_elapsed))
        );
        if snap.shots_discarded > 0 {
            let _ = writeln!(out, "  Discarded: {}", snap.shots_discarded);
        }
        let _ = writeln!(out, "  Samples:   {}", snap.samples_reported);
        let _ = writeln!(out, "  Instances: {}", snap.instances_started);
    }
    out
}

/// Print the summary to stdout
pub fn print_results(
    elapsed: Duration,
    reports: &[PoolReport],
    failure: Option<&EngineError>,
    counters: &BTreeMap<String, PoolSnapshot>,
) {
    print!("{}", render(elapsed, reports, failure, counters));
}
