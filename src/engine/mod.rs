//! Shooting engine
//!
//! The engine runs every configured [`pool::Pool`] concurrently under one
//! root cancellation token. The first pool failure cancels the token, which
//! stops every other pool; the engine then waits for all of them and returns
//! a composite error listing each failure.
//!
//! # Cancellation
//!
//! Once the token is cancelled (by a failure, a signal or the caller) every
//! pool gets [`SHUTDOWN_GRACE`] to return. Pools still running after that
//! are aborted and reported as [`PoolError::ShutdownTimeout`].
//!
//! # Example
//!
//! ```no_run
//! use loadtool::config::Config;
//! use loadtool::engine::Engine;
//! use loadtool::stats::StatsRegistry;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(config: Config) -> anyhow::Result<()> {
//! let engine = Engine::from_config(&config, &StatsRegistry::new()).await?;
//! let reports = engine.run(CancellationToken::new()).await?;
//! for report in reports {
//!     println!("{}: {} shots", report.id, report.shots_fired);
//! }
//! # Ok(())
//! # }
//! ```

pub mod instance;
pub mod pool;

use crate::config::Config;
use crate::error::{ConfigError, EngineError, PoolError};
use crate::stats::StatsRegistry;
use futures::FutureExt;
use pool::{Pool, PoolReport};
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long subsystems get to stop after cancellation
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Engine {
    pools: Vec<Pool>,
    grace: Duration,
}

impl Engine {
    pub fn new(pools: Vec<Pool>) -> Self {
        Self {
            pools,
            grace: SHUTDOWN_GRACE,
        }
    }

    /// Override the shutdown grace period
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Build every pool of a config; counters are registered in `registry`
    pub async fn from_config(config: &Config, registry: &StatsRegistry) -> Result<Self, ConfigError> {
        let mut pools = Vec::with_capacity(config.pools.len());
        for cfg in &config.pools {
            let pool = Pool::from_config(cfg, registry.pool(&cfg.id))
                .await
                .map_err(|e| ConfigError::new(format!("pool {:?}: {}", cfg.id, e.0)))?;
            pools.push(pool);
        }
        Ok(Self::new(pools))
    }

    /// Run every pool to completion
    ///
    /// Pools stopped by cancellation are not failures; the returned reports
    /// cover the pools that finished on their own.
    pub async fn run(self, root: CancellationToken) -> Result<Vec<PoolReport>, EngineError> {
        let token = root.child_token();
        let mut tasks: JoinSet<(String, Result<PoolReport, PoolError>)> = JoinSet::new();
        let mut pending = BTreeSet::new();

        info!(pools = self.pools.len(), "Engine starting");
        for pool in self.pools {
            let id = pool.id().to_string();
            pending.insert(id.clone());
            let pool_token = token.child_token();
            tasks.spawn(async move {
                let result = AssertUnwindSafe(pool.run(pool_token))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(PoolError::Panicked("pool runner panicked".to_string())));
                (id, result)
            });
        }

        let mut reports = Vec::new();
        let mut failures: Vec<(String, PoolError)> = Vec::new();
        let mut deadline: Option<Instant> = None;

        while !tasks.is_empty() {
            let joined = match deadline {
                None => tokio::select! {
                    joined = tasks.join_next() => joined,
                    _ = token.cancelled() => {
                        deadline = Some(Instant::now() + self.grace);
                        continue;
                    }
                },
                Some(at) => tokio::select! {
                    joined = tasks.join_next() => joined,
                    _ = tokio::time::sleep_until(at) => {
                        for id in std::mem::take(&mut pending) {
                            warn!(pool = %id, "Pool did not stop in time");
                            failures.push((id, PoolError::ShutdownTimeout(self.grace)));
                        }
                        tasks.abort_all();
                        break;
                    }
                },
            };
            let Some(joined) = joined else {
                break;
            };
            let (id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Pool task failed to join");
                    continue;
                }
            };
            pending.remove(&id);
            match result {
                Ok(report) => reports.push(report),
                Err(e) if e.is_cancelled() => info!(pool = %id, "Pool cancelled"),
                Err(e) => {
                    error!(pool = %id, error = %e, "Pool failed, cancelling the run");
                    failures.push((id, e));
                    token.cancel();
                }
            }
        }

        if failures.is_empty() {
            Ok(reports)
        } else {
            Err(EngineError { failures })
        }
    }
}
