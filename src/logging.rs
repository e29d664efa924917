//! Tracing subscriber setup
//!
//! `RUST_LOG` wins when set; otherwise the level comes from `log.level`.
//! Output goes to stderr, or appends to `log.file`.

use crate::config::LogConfig;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Build the level filter for `cfg`
pub fn filter(cfg: &LogConfig) -> Result<EnvFilter> {
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        return Ok(env_filter);
    }
    EnvFilter::try_new(cfg.level.to_ascii_lowercase())
        .with_context(|| format!("Invalid log level: {}", cfg.level))
}

/// Install the global subscriber
pub fn init(cfg: &LogConfig) -> Result<()> {
    let filter = filter(cfg)?;
    let layer = fmt::layer().compact().with_target(false).with_thread_names(true);

    match &cfg.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            tracing_subscriber::registry()
                .with(layer.with_ansi(false).with_writer(Mutex::new(file)))
                .with(filter)
                .try_init()
                .context("Failed to install log subscriber")?;
        }
        None => {
            tracing_subscriber::registry()
                .with(layer.with_writer(std::io::stderr))
                .with(filter)
                .try_init()
                .context("Failed to install log subscriber")?;
        }
    }
    Ok(())
}
