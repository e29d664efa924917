//! loadtool CLI entry point

use anyhow::{Context, Result};
use loadtool::config::{cli::Cli, example::EXAMPLE_YAML, file, Config};
use loadtool::engine::{Engine, SHUTDOWN_GRACE};
use loadtool::output::text::print_results;
use loadtool::stats::expvar::ExpvarServer;
use loadtool::stats::StatsRegistry;
use loadtool::{logging, registry};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit code after SIGINT/SIGTERM
const EXIT_INTERRUPTED: u8 = 130;

fn main() -> Result<ExitCode> {
    let cli = Cli::parse_args();
    cli.validate()?;

    if cli.example {
        print!("{}", EXAMPLE_YAML);
        return Ok(ExitCode::SUCCESS);
    }
    if cli.plugins {
        print!("{}", registry::describe());
        return Ok(ExitCode::SUCCESS);
    }

    println!("loadtool v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let path = cli.config.as_deref().context("a config file is required")?;
    let mut config = file::load(path)?;
    cli.merge_into(&mut config);
    if let Err(e) = config.validate() {
        anyhow::bail!("Invalid configuration: {}", e);
    }

    logging::init(&config.log)?;
    print!("{}", config);
    println!();

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<ExitCode> {
    let stats = StatsRegistry::new();
    let root = CancellationToken::new();

    if config.monitoring.expvar.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.monitoring.expvar.port));
        let server = ExpvarServer::bind(addr, stats.clone()).await?;
        let token = root.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                warn!(error = %e, "expvar endpoint stopped");
            }
        });
    }

    let engine = Engine::from_config(&config, &stats)
        .await
        .context("Configuration validation failed")?;

    let interrupted = Arc::new(AtomicBool::new(false));
    tokio::spawn(watch_signals(root.clone(), Arc::clone(&interrupted)));

    println!("Starting run...");
    println!();
    let started = Instant::now();
    let result = engine.run(root.clone()).await;
    let elapsed = started.elapsed();
    root.cancel();

    let (reports, failure) = match result {
        Ok(reports) => (reports, None),
        Err(e) => (Vec::new(), Some(e)),
    };
    print_results(elapsed, &reports, failure.as_ref(), &stats.snapshot());

    if let Some(e) = failure {
        error!(error = %e, "Run failed");
        eprintln!("Error: {}", e);
        return Ok(ExitCode::FAILURE);
    }
    if interrupted.load(Ordering::Relaxed) {
        info!("Run interrupted");
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    Ok(ExitCode::SUCCESS)
}

/// Cancel the run on SIGINT/SIGTERM; exit hard when shutdown stalls
///
/// A second signal, or the grace period running out, terminates the process.
async fn watch_signals(root: CancellationToken, interrupted: Arc<AtomicBool>) {
    tokio::select! {
        _ = root.cancelled() => return,
        res = shutdown_signal() => {
            if let Err(e) = res {
                error!(error = %e, "Unable to listen for signals");
                return;
            }
        }
    }

    warn!("Signal received, stopping pools");
    eprintln!("Stopping, press Ctrl-C again to exit immediately");
    interrupted.store(true, Ordering::Relaxed);
    root.cancel();

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = tokio::time::sleep(SHUTDOWN_GRACE + Duration::from_secs(1)) => {}
    }
    eprintln!("Shutdown did not finish in time, exiting");
    std::process::exit(EXIT_INTERRUPTED.into());
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
