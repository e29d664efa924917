//! `http/scenario` ammo
//!
//! One pass walks the weighted rotation once; every record is a scenario
//! handle tagged with the scenario name.

use super::{AmmoSource, RecordDecoder};
use crate::ammo::{Ammo, Payload};
use crate::error::{AmmoDecodeError, ConfigError};
use crate::scenario::{file, Scenario};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

pub struct ScenarioSource {
    rotation: Arc<Vec<Arc<Scenario>>>,
}

impl ScenarioSource {
    /// Parse and compile a scenario file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::new(file::load(path)?))
    }

    pub fn new(rotation: Vec<Arc<Scenario>>) -> Self {
        Self {
            rotation: Arc::new(rotation),
        }
    }
}

#[async_trait]
impl AmmoSource for ScenarioSource {
    async fn open(&self) -> anyhow::Result<Box<dyn RecordDecoder>> {
        Ok(Box::new(ScenarioDecoder {
            rotation: Arc::clone(&self.rotation),
            pos: 0,
        }))
    }
}

struct ScenarioDecoder {
    rotation: Arc<Vec<Arc<Scenario>>>,
    pos: usize,
}

#[async_trait]
impl RecordDecoder for ScenarioDecoder {
    async fn decode(&mut self, ammo: &mut Ammo) -> Option<Result<(), AmmoDecodeError>> {
        let scenario = self.rotation.get(self.pos)?;
        self.pos += 1;
        ammo.tag.clear();
        ammo.tag.push_str(&scenario.name);
        ammo.payload = Payload::Scenario(Arc::clone(scenario));
        Some(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_weighted_round_robin() {
        let yaml = r#"
requests: [{name: r, uri: /}]
scenarios:
  - {name: a, weight: 20, requests: [r]}
  - {name: b, weight: 30, requests: [r]}
  - {name: c, weight: 60, requests: [r]}
"#;
        let parsed = file::parse(Path::new("s.yaml"), yaml).unwrap();
        let rotation = file::build(&parsed, Path::new(".")).unwrap();
        let provider = Arc::new(Provider::from_source(Box::new(ScenarioSource::new(rotation)), 110, 0, 16));

        let runner = {
            let provider = Arc::clone(&provider);
            tokio::spawn(async move { provider.run(CancellationToken::new()).await })
        };
        let mut counts = std::collections::BTreeMap::new();
        let mut last_id = 0;
        while let Some(ammo) = provider.acquire().await {
            assert!(matches!(ammo.payload, Payload::Scenario(_)));
            assert_eq!(ammo.id, last_id + 1);
            last_id = ammo.id;
            *counts.entry(ammo.tag.clone()).or_insert(0) += 1;
            provider.release(ammo);
        }
        runner.await.unwrap().unwrap();

        assert_eq!(last_id, 110);
        assert_eq!(counts["a"], 20);
        assert_eq!(counts["b"], 30);
        assert_eq!(counts["c"], 60);
    }

    #[test]
    fn test_missing_file_is_a_config_error() {
        let err = ScenarioSource::load(Path::new("/nonexistent/scenario.yaml")).err().unwrap();
        assert!(err.to_string().contains("Failed to read scenario file"));
    }
}
