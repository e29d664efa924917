//! Instance pool
//!
//! A pool owns one provider, one aggregator, the rate and startup schedules
//! and a gun factory. It spawns one instance per startup token and runs until
//! every started instance is done, or until cancelled or failed.
//!
//! Task layout under the pool token:
//!
//! ```text
//! pool ──┬── provider.run()        feeds the ammo queue
//!        ├── aggregator.run()      drains samples into the sink
//!        └── instance #0..#n       acquire -> wait token -> shoot
//! ```
//!
//! The aggregator inbox closes only after every instance has exited, so all
//! samples reported by guns reach the sink on graceful shutdown.

use super::instance::{Instance, InstanceExit};
use super::SHUTDOWN_GRACE;
use crate::aggregator::{Aggregator, Reporter};
use crate::config::PoolConfig;
use crate::error::{ConfigError, PoolError};
use crate::gun::{GunDeps, GunFactory};
use crate::provider::Provider;
use crate::schedule::SchedulePlan;
use crate::stats::PoolStats;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Outcome of a pool that finished without failing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub id: String,
    pub instances: usize,
    pub shots_fired: u64,
    pub samples_written: u64,
    pub elapsed: Duration,
}

/// Everything a pool is assembled from
pub struct PoolParts {
    pub id: String,
    pub provider: Provider,
    pub aggregator: Aggregator,
    pub reporter: Reporter,
    pub gun: Arc<dyn GunFactory>,
    pub rps: SchedulePlan,
    pub startup: SchedulePlan,
    /// Give every instance its own rate schedule
    pub rps_per_instance: bool,
    pub discard_overflow: bool,
    pub stats: Arc<PoolStats>,
}

pub struct Pool {
    parts: PoolParts,
}

/// How the main loop ended
enum Stop {
    Done,
    Cancelled,
    Failed(PoolError),
    AggregatorFailed,
}

impl Pool {
    pub fn new(parts: PoolParts) -> Self {
        Self { parts }
    }

    /// Build every component of a pool from its config
    ///
    /// Opens the aggregator destination and parses scenario files, so config
    /// problems surface before any pool starts.
    pub async fn from_config(cfg: &PoolConfig, stats: Arc<PoolStats>) -> Result<Self, ConfigError> {
        cfg.validate().map_err(ConfigError::new)?;
        let provider = cfg.provider.build()?;
        let gun = cfg.gun.build()?;
        let (aggregator, reporter) = cfg.aggregator.build(Arc::clone(&stats)).await?;
        Ok(Self::new(PoolParts {
            id: cfg.id.clone(),
            provider,
            aggregator,
            reporter,
            gun,
            rps: cfg.rps.clone(),
            startup: cfg.startup.clone(),
            rps_per_instance: cfg.rps_per_instance,
            discard_overflow: cfg.discard_overflow,
            stats,
        }))
    }

    pub fn id(&self) -> &str {
        &self.parts.id
    }

    /// Run until done, cancelled through `parent`, or failed
    ///
    /// Returns [`PoolError::Cancelled`] when `parent` was cancelled by
    /// someone else.
    pub async fn run(self, parent: CancellationToken) -> Result<PoolReport, PoolError> {
        let span = info_span!("pool", pool = %self.parts.id);
        self.run_inner(parent).instrument(span).await
    }

    async fn run_inner(self, parent: CancellationToken) -> Result<PoolReport, PoolError> {
        let PoolParts {
            id,
            provider,
            aggregator,
            reporter,
            gun,
            rps,
            startup,
            rps_per_instance,
            discard_overflow,
            stats,
        } = self.parts;
        let started = Instant::now();
        let startup = startup.build()?;
        let shared_rate = if rps_per_instance { None } else { Some(rps.build()?) };

        let cancel = parent.child_token();
        let provider_stop = cancel.child_token();
        let force_stop = CancellationToken::new();

        let provider = Arc::new(provider);
        let mut provider_task: JoinHandle<Result<(), PoolError>> = {
            let provider = Arc::clone(&provider);
            let token = provider_stop.clone();
            tokio::spawn(async move { provider.run(token).await }.in_current_span())
        };
        let mut aggregator_task = tokio::spawn(aggregator.run(force_stop.clone()).in_current_span());

        info!("Warming up gun");
        let warmed = tokio::select! {
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            r = gun.warm_up(&cancel) => r.map_err(PoolError::WarmUp),
        };
        let shared = match warmed {
            Ok(shared) => shared,
            Err(err) => {
                cancel.cancel();
                drop(reporter);
                let _ = provider_task.await;
                let _ = aggregator_task.await;
                if !err.is_cancelled() {
                    error!(error = %err, "Pool failed");
                }
                return Err(err);
            }
        };

        let origin = Instant::now();
        startup.start(origin);
        if let Some(ref rate) = shared_rate {
            rate.start(origin);
        }

        let mut instances: JoinSet<Result<InstanceExit, PoolError>> = JoinSet::new();
        let mut spawned = 0usize;
        let mut pending_start = startup.next();
        if pending_start.is_none() {
            cancel.cancel();
            drop(reporter);
            let _ = provider_task.await;
            let _ = aggregator_task.await;
            return Err(PoolError::NoInstances);
        }
        let mut provider_done = false;
        let mut aggregator_done = false;
        let mut aggregator_result: Option<Result<u64, PoolError>> = None;
        let mut drained = false;

        let stop = loop {
            if pending_start.is_none() && instances.is_empty() {
                break Stop::Done;
            }
            let start_at = pending_start.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Stop::Cancelled,
                r = &mut provider_task, if !provider_done => {
                    provider_done = true;
                    match r {
                        Ok(Ok(())) => debug!("Provider finished"),
                        Ok(Err(e)) => break Stop::Failed(e),
                        Err(e) => break Stop::Failed(PoolError::Provider(anyhow::anyhow!("provider task failed: {}", e))),
                    }
                }
                r = &mut aggregator_task, if !aggregator_done => {
                    aggregator_done = true;
                    let r = r.unwrap_or_else(|e| Err(PoolError::Aggregator(anyhow::anyhow!("aggregator task failed: {}", e))));
                    let failed = r.is_err();
                    aggregator_result = Some(r);
                    if failed {
                        break Stop::AggregatorFailed;
                    }
                }
                Some(joined) = instances.join_next(), if !instances.is_empty() => {
                    match joined {
                        Ok(Ok(InstanceExit::Cancelled)) => {}
                        Ok(Ok(exit)) => {
                            debug!(?exit, "Instance exited");
                            drained = true;
                        }
                        Ok(Err(e)) => break Stop::Failed(e),
                        Err(e) => break Stop::Failed(PoolError::Panicked(e.to_string())),
                    }
                    if drained && instances.is_empty() && pending_start.is_some() {
                        debug!(spawned, "Every instance ran dry, stopping startup schedule");
                        pending_start = None;
                    }
                }
                _ = tokio::time::sleep_until(start_at), if pending_start.is_some() => {
                    let rate = match shared_rate {
                        Some(ref rate) => Arc::clone(rate),
                        None => match rps.build() {
                            Ok(rate) => {
                                rate.start(Instant::now());
                                rate
                            }
                            Err(e) => break Stop::Failed(e.into()),
                        },
                    };
                    let instance_id = spawned;
                    spawned += 1;
                    let instance_span = info_span!("instance", instance = instance_id);
                    let deps = GunDeps {
                        pool_id: id.clone(),
                        instance_id,
                        cancel: cancel.clone(),
                        span: instance_span.clone(),
                        reporter: reporter.clone(),
                        shared: Arc::clone(&shared),
                    };
                    let gun = match gun.new_gun(deps) {
                        Ok(gun) => gun,
                        Err(e) => break Stop::Failed(PoolError::FatalInstance {
                            instance_id,
                            reason: format!("{:#}", e),
                        }),
                    };
                    let instance = Instance {
                        id: instance_id,
                        provider: Arc::clone(&provider),
                        rate,
                        gun,
                        reporter: reporter.clone(),
                        stats: Arc::clone(&stats),
                        cancel: cancel.clone(),
                        discard_overflow,
                    };
                    instances.spawn(instance.run().instrument(instance_span));
                    debug!(instance = instance_id, "Instance started");
                    pending_start = startup.next();
                }
            }
        };

        let failure = match stop {
            Stop::Done => None,
            Stop::Cancelled => Some(PoolError::Cancelled),
            Stop::Failed(e) => Some(e),
            Stop::AggregatorFailed => aggregator_result.take().and_then(Result::err),
        };
        if let Some(ref e) = failure {
            if !e.is_cancelled() {
                error!(error = %e, "Pool failed");
            }
            cancel.cancel();
        }

        // Instances observe the pool token; on a clean stop they are all gone
        while let Some(joined) = instances.join_next().await {
            if let Ok(Err(e)) = joined {
                debug!(error = %e, "Instance failed during shutdown");
            }
        }
        drop(reporter);
        drop(shared);

        provider_stop.cancel();
        if !provider_done {
            match provider_task.await {
                Ok(Err(e)) if failure.is_none() => warn!(error = %e, "Provider failed after the last shot"),
                _ => {}
            }
        }

        let aggregated = match aggregator_result {
            Some(r) => r,
            None if aggregator_done => Ok(0),
            None if failure.is_some() || parent.is_cancelled() => {
                match tokio::time::timeout(SHUTDOWN_GRACE, &mut aggregator_task).await {
                    Ok(joined) => joined.unwrap_or_else(|e| Err(PoolError::Panicked(e.to_string()))),
                    Err(_) => {
                        force_stop.cancel();
                        aggregator_task
                            .await
                            .unwrap_or_else(|e| Err(PoolError::Panicked(e.to_string())))
                    }
                }
            }
            None => aggregator_task
                .await
                .unwrap_or_else(|e| Err(PoolError::Panicked(e.to_string()))),
        };

        if let Some(e) = failure {
            return Err(e);
        }
        let samples_written = aggregated?;

        let report = PoolReport {
            id,
            instances: spawned,
            shots_fired: stats.shots_fired.get(),
            samples_written,
            elapsed: started.elapsed(),
        };
        info!(
            instances = report.instances,
            shots = report.shots_fired,
            samples = report.samples_written,
            "Pool finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::MemorySink;
    use crate::ammo::Ammo;
    use crate::engine::instance::tests::RecordingGun;
    use crate::gun::{Gun, SharedState};
    use crate::provider::tests::VecSource;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Factory handing out recording guns; the shots are shared
    #[derive(Default)]
    struct TestGuns {
        shots: Arc<Mutex<Vec<(Instant, u64)>>>,
        panic_on: Option<u64>,
        fail_warm_up: bool,
    }

    #[async_trait]
    impl GunFactory for TestGuns {
        fn accepts(&self, payload_kind: &str) -> bool {
            payload_kind == "http"
        }

        async fn warm_up(&self, _cancel: &CancellationToken) -> anyhow::Result<SharedState> {
            if self.fail_warm_up {
                anyhow::bail!("target refused");
            }
            Ok(Arc::new(()))
        }

        fn new_gun(&self, deps: GunDeps) -> anyhow::Result<Box<dyn Gun>> {
            Ok(Box::new(RecordingGun {
                shots: Arc::clone(&self.shots),
                reporter: deps.reporter,
                panic_on: self.panic_on,
            }))
        }
    }

    fn plan(yaml: &str) -> SchedulePlan {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn pool(guns: TestGuns, tags: Vec<&'static str>, limit: u64, passes: u64, rps: &str, startup: &str) -> (Pool, MemorySink, Arc<PoolStats>) {
        let stats = Arc::new(PoolStats::default());
        let sink = MemorySink::default();
        let (aggregator, reporter) = Aggregator::new(Box::new(sink.clone()), 64, Arc::clone(&stats));
        let pool = Pool::new(PoolParts {
            id: "test".to_string(),
            provider: Provider::from_source(Box::new(VecSource(tags)), limit, passes, 8),
            aggregator,
            reporter,
            gun: Arc::new(guns),
            rps: plan(rps),
            startup: plan(startup),
            rps_per_instance: false,
            discard_overflow: false,
            stats: Arc::clone(&stats),
        });
        (pool, sink, stats)
    }

    #[tokio::test(start_paused = true)]
    async fn test_shots_bounded_by_limit() {
        let (pool, sink, stats) = pool(
            TestGuns::default(),
            vec!["a", "b", "c"],
            7,
            0,
            "{type: unlimited, duration: 10s}",
            "{type: once, times: 3}",
        );
        let report = pool.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.shots_fired, 7);
        assert_eq!(report.samples_written, 7);
        assert_eq!(report.instances, 3);
        assert_eq!(sink.tags.lock().unwrap().len(), 7);
        assert_eq!(stats.instances_alive.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_passes_bound_total_shots() {
        let guns = TestGuns::default();
        let shots = Arc::clone(&guns.shots);
        let (pool, _sink, _) = pool(guns, vec!["a", "b"], 0, 3, "{type: unlimited, duration: 10s}", "{type: once, times: 2}");
        pool.run(CancellationToken::new()).await.unwrap();
        let mut ids: Vec<u64> = shots.lock().unwrap().iter().map(|(_, id)| *id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=6).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_schedule_ends_pool() {
        let guns = TestGuns::default();
        let shots = Arc::clone(&guns.shots);
        let (pool, _sink, _) = pool(guns, vec!["a"], 0, 0, "{type: const, ops: 10, duration: 1s}", "{type: once, times: 2}");
        let report = pool.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.shots_fired, 10);
        let shots = shots.lock().unwrap();
        let first = shots.iter().map(|(t, _)| *t).min().unwrap();
        let last = shots.iter().map(|(t, _)| *t).max().unwrap();
        assert!(last - first >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_cancels_remaining_startup() {
        let (pool, _sink, stats) = pool(
            TestGuns::default(),
            vec!["a", "b"],
            0,
            1,
            "{type: unlimited, duration: 1m}",
            "{type: instance_const, count: 100, duration: 1m}",
        );
        let began = Instant::now();
        let report = pool.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.shots_fired, 2);
        assert!(report.instances < 100);
        assert!(began.elapsed() < Duration::from_secs(60));
        assert_eq!(stats.instances_alive.get(), 0);
    }

    #[tokio::test]
    async fn test_warm_up_failure_fails_pool_before_shots() {
        let guns = TestGuns {
            fail_warm_up: true,
            ..TestGuns::default()
        };
        let (pool, sink, stats) = pool(guns, vec!["a"], 0, 0, "{type: once, times: 1}", "{type: once, times: 1}");
        let err = pool.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PoolError::WarmUp(_)));
        assert!(err.to_string().contains("target refused"));
        assert_eq!(stats.shots_fired.get(), 0);
        assert!(sink.tags.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_startup_is_an_error() {
        let (pool, _sink, _) = pool(TestGuns::default(), vec!["a"], 0, 0, "{type: once, times: 1}", "{type: once, times: 0}");
        assert!(matches!(pool.run(CancellationToken::new()).await, Err(PoolError::NoInstances)));
    }

    #[tokio::test]
    async fn test_gun_panic_fails_pool() {
        let guns = TestGuns {
            panic_on: Some(3),
            ..TestGuns::default()
        };
        let (pool, sink, _) = pool(guns, vec!["a"], 0, 0, "{type: unlimited, duration: 5s}", "{type: once, times: 1}");
        let err = pool.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PoolError::FatalInstance { instance_id: 0, .. }));
        // Two good shots plus the panic sample
        assert_eq!(sink.tags.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel_drains_aggregator() {
        let (pool, sink, stats) = pool(
            TestGuns::default(),
            vec!["a"],
            0,
            0,
            "{type: const, ops: 100, duration: 1m}",
            "{type: once, times: 4}",
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pool.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(sink.tags.lock().unwrap().len() as u64, stats.samples_reported.get());
        assert!(stats.shots_fired.get() >= 40);
    }

    #[test]
    fn test_ammo_is_plain_data() {
        // Instances move ammo across tasks
        fn assert_send<T: Send + 'static>() {}
        assert_send::<Ammo>();
    }
}
