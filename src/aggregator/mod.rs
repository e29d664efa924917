//! Sample aggregation
//!
//! Guns hand samples to a [`Reporter`]; the [`Aggregator`] task drains them
//! into a [`SampleSink`]. The channel between them is bounded, so a slow sink
//! slows the guns down instead of growing memory.
//!
//! Shutdown is driven by the reporters: once every reporter clone is dropped
//! (all instances exited), the aggregator drains what is buffered, flushes the
//! sink and returns. The separate force-stop token exists only for the grace
//! period timeout.

pub mod log;
pub mod phout;

use crate::error::{ConfigError, PoolError};
use crate::sample::Sample;
use crate::stats::PoolStats;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default capacity of the report channel
pub const DEFAULT_REPORT_BUFFER: usize = 65536;

/// Where samples end up
#[async_trait]
pub trait SampleSink: Send {
    async fn write(&mut self, sample: &Sample) -> anyhow::Result<()>;

    async fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Aggregator section of a pool, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregatorConfig {
    Phout(phout::PhoutConfig),
    Log {
        #[serde(default = "default_report_buffer")]
        buffer_size: usize,
    },
    Discard {
        #[serde(default = "default_report_buffer")]
        buffer_size: usize,
    },
}

fn default_report_buffer() -> usize {
    DEFAULT_REPORT_BUFFER
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig::Phout(phout::PhoutConfig::default())
    }
}

impl AggregatorConfig {
    pub fn buffer_size(&self) -> usize {
        match self {
            AggregatorConfig::Phout(c) => c.buffer_size,
            AggregatorConfig::Log { buffer_size } | AggregatorConfig::Discard { buffer_size } => *buffer_size,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_size() == 0 {
            return Err("aggregator buffer_size must be greater than 0".to_string());
        }
        if let AggregatorConfig::Phout(c) = self {
            if c.destination.as_os_str().is_empty() {
                return Err("phout destination must be set".to_string());
            }
        }
        Ok(())
    }

    /// Open the sink and create the aggregator with its reporter
    pub async fn build(&self, stats: Arc<PoolStats>) -> Result<(Aggregator, Reporter), ConfigError> {
        self.validate().map_err(ConfigError::new)?;
        let sink: Box<dyn SampleSink> = match self {
            AggregatorConfig::Phout(c) => Box::new(
                phout::PhoutSink::open(c)
                    .await
                    .map_err(|e| ConfigError::new(format!("{:#}", e)))?,
            ),
            AggregatorConfig::Log { .. } => Box::new(log::LogSink),
            AggregatorConfig::Discard { .. } => Box::new(DiscardSink),
        };
        Ok(Aggregator::new(sink, self.buffer_size(), stats))
    }
}

impl fmt::Display for AggregatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregatorConfig::Phout(c) => write!(f, "phout ({})", c.destination.display()),
            AggregatorConfig::Log { .. } => write!(f, "log"),
            AggregatorConfig::Discard { .. } => write!(f, "discard"),
        }
    }
}

/// Drops every sample
pub struct DiscardSink;

#[async_trait]
impl SampleSink for DiscardSink {
    async fn write(&mut self, _sample: &Sample) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Sending half handed to guns
#[derive(Clone)]
pub struct Reporter {
    tx: mpsc::Sender<Sample>,
    stats: Arc<PoolStats>,
}

impl Reporter {
    /// Hand a sample to the aggregator, waiting while the buffer is full
    ///
    /// A sample reported after the aggregator stopped is dropped.
    pub async fn report(&self, sample: Sample) {
        match self.tx.send(sample).await {
            Ok(()) => self.stats.samples_reported.inc(),
            Err(_) => debug!("Aggregator is gone, dropping sample"),
        }
    }
}

/// Receiving half plus the sink
pub struct Aggregator {
    rx: mpsc::Receiver<Sample>,
    sink: Box<dyn SampleSink>,
}

impl Aggregator {
    pub fn new(sink: Box<dyn SampleSink>, buffer_size: usize, stats: Arc<PoolStats>) -> (Self, Reporter) {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        (Self { rx, sink }, Reporter { tx, stats })
    }

    /// Drain samples into the sink until every reporter is dropped
    ///
    /// `force_stop` abandons whatever is still buffered. Returns the number of
    /// samples written.
    pub async fn run(mut self, force_stop: CancellationToken) -> Result<u64, PoolError> {
        let mut written = 0u64;
        loop {
            let sample = tokio::select! {
                biased;
                _ = force_stop.cancelled() => {
                    warn!(written, "Aggregator force-stopped, buffered samples are dropped");
                    break;
                }
                sample = self.rx.recv() => sample,
            };
            let Some(sample) = sample else {
                break;
            };
            self.sink.write(&sample).await.map_err(PoolError::Aggregator)?;
            written += 1;
        }
        self.sink.flush().await.map_err(PoolError::Aggregator)?;
        debug!(written, "Aggregator finished");
        Ok(written)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Sink recording tags, optionally slow
    #[derive(Clone, Default)]
    pub(crate) struct MemorySink {
        pub tags: Arc<Mutex<Vec<String>>>,
        pub delay: Duration,
    }

    #[async_trait]
    impl SampleSink for MemorySink {
        async fn write(&mut self, sample: &Sample) -> anyhow::Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.tags.lock().unwrap().push(sample.tag.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_drains_everything_after_reporters_drop() {
        let sink = MemorySink::default();
        let stats = Arc::new(PoolStats::default());
        let (aggregator, reporter) = Aggregator::new(Box::new(sink.clone()), 2, Arc::clone(&stats));
        let task = tokio::spawn(aggregator.run(CancellationToken::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let reporter = reporter.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..25 {
                    reporter.report(Sample::start(format!("{}-{}", i, j))).await;
                }
            }));
        }
        drop(reporter);
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(task.await.unwrap().unwrap(), 100);
        assert_eq!(sink.tags.lock().unwrap().len(), 100);
        assert_eq!(stats.samples_reported.get(), 100);
    }

    #[tokio::test]
    async fn test_per_reporter_order_is_kept() {
        let sink = MemorySink::default();
        let (aggregator, reporter) = Aggregator::new(Box::new(sink.clone()), 1, Arc::new(PoolStats::default()));
        let task = tokio::spawn(aggregator.run(CancellationToken::new()));
        for j in 0..10 {
            reporter.report(Sample::start(j.to_string())).await;
        }
        drop(reporter);
        task.await.unwrap().unwrap();
        let tags = sink.tags.lock().unwrap().clone();
        assert_eq!(tags, (0..10).map(|j| j.to_string()).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_stop_abandons_buffer() {
        let sink = MemorySink {
            delay: Duration::from_secs(1),
            ..MemorySink::default()
        };
        let (aggregator, reporter) = Aggregator::new(Box::new(sink.clone()), 8, Arc::new(PoolStats::default()));
        for j in 0..5 {
            reporter.report(Sample::start(j.to_string())).await;
        }
        let stop = CancellationToken::new();
        let task = tokio::spawn(aggregator.run(stop.clone()));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        stop.cancel();
        let written = task.await.unwrap().unwrap();
        assert!(written < 5);
    }

    #[test]
    fn test_config_parsing() {
        let cfg: AggregatorConfig =
            serde_yaml::from_str("type: phout\ndestination: ./phout.log\n").unwrap();
        assert_eq!(cfg.buffer_size(), DEFAULT_REPORT_BUFFER);
        assert_eq!(cfg.to_string(), "phout (./phout.log)");
        let cfg: AggregatorConfig = serde_yaml::from_str("type: discard\nbuffer_size: 4").unwrap();
        assert_eq!(cfg.buffer_size(), 4);
        assert!(serde_yaml::from_str::<AggregatorConfig>("type: influx").is_err());
    }
}
