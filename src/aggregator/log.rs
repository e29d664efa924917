//! Sink that logs every sample

use super::SampleSink;
use crate::sample::Sample;
use async_trait::async_trait;
use tracing::info;

pub struct LogSink;

#[async_trait]
impl SampleSink for LogSink {
    async fn write(&mut self, sample: &Sample) -> anyhow::Result<()> {
        info!(
            target: "loadtool::sample",
            tag = %sample.tag,
            code = sample.proto_code,
            rt_us = sample.elapsed.as_micros() as u64,
            error = ?sample.error,
            "sample"
        );
        Ok(())
    }
}
