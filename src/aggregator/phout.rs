//! Phantom-compatible output
//!
//! One tab-separated line per sample:
//!
//! ```text
//! ts.sss  tag  rt  connect  send  latency  receive  interval_event  egress  igress  net_code  proto_code
//! ```
//!
//! `ts` is seconds since the epoch with millisecond precision, durations are
//! microseconds.

use super::{default_report_buffer, SampleSink};
use crate::sample::Sample;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

/// Tag written for samples without one
pub const EMPTY_TAG: &str = "__EMPTY__";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhoutConfig {
    /// Output file; `-` or `stdout` writes to standard output
    #[serde(default = "default_destination")]
    pub destination: PathBuf,

    #[serde(default = "default_report_buffer")]
    pub buffer_size: usize,
}

fn default_destination() -> PathBuf {
    PathBuf::from("phout.log")
}

impl Default for PhoutConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            buffer_size: default_report_buffer(),
        }
    }
}

pub struct PhoutSink {
    out: BufWriter<Box<dyn AsyncWrite + Send + Unpin>>,
    line: String,
}

impl PhoutSink {
    pub async fn open(cfg: &PhoutConfig) -> anyhow::Result<Self> {
        let dest = cfg.destination.to_string_lossy();
        let out: Box<dyn AsyncWrite + Send + Unpin> = if dest == "-" || dest == "stdout" {
            Box::new(tokio::io::stdout())
        } else {
            let file = tokio::fs::File::create(&cfg.destination)
                .await
                .with_context(|| format!("Failed to create phout file: {}", cfg.destination.display()))?;
            Box::new(file)
        };
        Ok(Self::new(out))
    }

    pub fn new(out: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            out: BufWriter::new(out),
            line: String::with_capacity(256),
        }
    }
}

/// Format one phout line including the trailing newline
pub fn format_line(sample: &Sample, out: &mut String) {
    let ts_millis = sample.timestamp.timestamp_millis();
    let rt = sample.elapsed.as_micros();
    let tag = if sample.tag.is_empty() {
        EMPTY_TAG.to_string()
    } else {
        sample.tag.replace(['\t', '\n', '\r'], " ")
    };
    let _ = writeln!(
        out,
        "{}.{:03}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        ts_millis.div_euclid(1000),
        ts_millis.rem_euclid(1000),
        tag,
        rt,
        sample.connect.as_micros(),
        sample.send.as_micros(),
        sample.latency.as_micros(),
        sample.receive.as_micros(),
        rt,
        sample.egress,
        sample.igress,
        sample.net_code(),
        sample.phout_proto_code(),
    );
}

#[async_trait]
impl SampleSink for PhoutSink {
    async fn write(&mut self, sample: &Sample) -> anyhow::Result<()> {
        self.line.clear();
        format_line(sample, &mut self.line);
        self.out
            .write_all(self.line.as_bytes())
            .await
            .context("Failed to write phout line")
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        self.out.flush().await.context("Failed to flush phout output")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleError;
    use chrono::TimeZone;
    use std::time::Duration;

    fn sample(tag: &str) -> Sample {
        let mut s = Sample::start(tag);
        s.timestamp = chrono::Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        s.elapsed = Duration::from_micros(1500);
        s.latency = Duration::from_micros(1200);
        s.receive = Duration::from_micros(300);
        s.egress = 80;
        s.igress = 512;
        s.proto_code = 200;
        s
    }

    #[test]
    fn test_line_layout() {
        let mut line = String::new();
        format_line(&sample("main"), &mut line);
        assert_eq!(line, "1700000000.123\tmain\t1500\t0\t0\t1200\t300\t1500\t80\t512\t0\t200\n");
    }

    #[test]
    fn test_error_and_empty_tag() {
        let mut s = sample("");
        s.set_error(SampleError::Transport("connection refused".to_string()));
        let mut line = String::new();
        format_line(&s, &mut line);
        let fields: Vec<&str> = line.trim_end().split('\t').collect();
        assert_eq!(fields.len(), 12);
        assert_eq!(fields[1], EMPTY_TAG);
        assert_eq!(fields[10], "999");
        assert_eq!(fields[11], "500");
    }

    #[test]
    fn test_tabs_in_tags_do_not_break_columns() {
        let mut line = String::new();
        format_line(&sample("a\tb"), &mut line);
        assert_eq!(line.split('\t').count(), 12);
    }

    #[tokio::test]
    async fn test_file_sink_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PhoutConfig {
            destination: dir.path().join("phout.log"),
            ..PhoutConfig::default()
        };
        let mut sink = PhoutSink::open(&cfg).await.unwrap();
        sink.write(&sample("a")).await.unwrap();
        sink.write(&sample("b")).await.unwrap();
        sink.flush().await.unwrap();
        let content = std::fs::read_to_string(&cfg.destination).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.ends_with('\n'));
    }
}
