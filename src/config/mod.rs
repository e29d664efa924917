//! Configuration module
//!
//! Handles CLI argument parsing, config files (YAML, JSON, TOML) and
//! validation. Component sections (`provider`, `gun`, `aggregator`, `rps`,
//! `startup`) are internally tagged by `type`, see [`crate::registry`].

pub mod cli;
pub mod duration;
pub mod example;
pub mod file;

use crate::aggregator::AggregatorConfig;
use crate::gun::GunConfig;
use crate::provider::ProviderConfig;
use crate::registry;
use crate::schedule::SchedulePlan;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// Complete run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// One instance pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name used in logs and counters; `pool-N` when empty
    #[serde(default)]
    pub id: String,

    #[serde(alias = "ammo")]
    pub provider: ProviderConfig,

    #[serde(default, alias = "result")]
    pub aggregator: AggregatorConfig,

    pub gun: GunConfig,

    /// Rate plan, shared by all instances unless `rps_per_instance`
    pub rps: SchedulePlan,

    /// Instance creation plan
    pub startup: SchedulePlan,

    #[serde(default, alias = "rps-per-instance")]
    pub rps_per_instance: bool,

    /// Skip ammo whose rate token is already overdue
    #[serde(default, alias = "discard-overflow")]
    pub discard_overflow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file; stderr when unset
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub expvar: ExpvarConfig,
}

/// JSON counter endpoint at `/debug/vars`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpvarConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_expvar_port")]
    pub port: u16,
}

fn default_expvar_port() -> u16 {
    crate::stats::expvar::DEFAULT_PORT
}

impl Default for ExpvarConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_expvar_port(),
        }
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

// Display trait implementations

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Configuration:")?;
        for pool in &self.pools {
            write!(f, "{}", pool)?;
        }
        writeln!(f, "  Log: {}", self.log)?;
        if self.monitoring.expvar.enabled {
            writeln!(f, "  Expvar: port {}", self.monitoring.expvar.port)?;
        }
        Ok(())
    }
}

impl fmt::Display for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Pool {}:", self.id)?;
        writeln!(f, "    Provider: {}", self.provider)?;
        writeln!(f, "    Gun: {}", self.gun)?;
        writeln!(f, "    Aggregator: {}", self.aggregator)?;
        write!(f, "    Rate: {}", self.rps)?;
        if self.rps_per_instance {
            write!(f, " per instance")?;
        }
        if self.discard_overflow {
            write!(f, ", discard overflow")?;
        }
        writeln!(f)?;
        writeln!(f, "    Startup: {}", self.startup)?;
        Ok(())
    }
}

impl fmt::Display for LogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(path) => write!(f, "{} -> {}", self.level, path.display()),
            None => write!(f, "{} -> stderr", self.level),
        }
    }
}

impl Config {
    /// Name unnamed pools `pool-N` (1-based, in file order)
    pub fn assign_pool_ids(&mut self) {
        for (i, pool) in self.pools.iter_mut().enumerate() {
            if pool.id.is_empty() {
                pool.id = format!("pool-{}", i + 1);
            }
        }
    }

    /// Validate the complete configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.pools.is_empty() {
            return Err("At least one pool must be specified".to_string());
        }

        let mut ids = BTreeSet::new();
        for (i, pool) in self.pools.iter().enumerate() {
            pool.validate().map_err(|e| format!("Pool {} ({}): {}", i, pool.id, e))?;
            if !ids.insert(pool.id.as_str()) {
                return Err(format!("Duplicate pool id {:?}", pool.id));
            }
        }

        if !LOG_LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            return Err(format!(
                "Unknown log level {:?}, expected one of {}",
                self.log.level,
                LOG_LEVELS.join(", ")
            ));
        }

        if self.monitoring.expvar.enabled && self.monitoring.expvar.port == 0 {
            return Err("Expvar port must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("pool id must be set".to_string());
        }
        self.provider.validate()?;
        self.gun.validate()?;
        self.aggregator.validate()?;
        self.rps.validate().map_err(|e| format!("rps: {}", e))?;
        self.startup.validate().map_err(|e| format!("startup: {}", e))?;

        if !registry::gun_accepts(self.gun.type_name(), self.provider.payload_kind()) {
            return Err(format!(
                "gun {} cannot fire {} ammo from provider {}",
                self.gun.type_name(),
                self.provider.payload_kind(),
                self.provider.type_name()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POOL: &str = r#"
pools:
  - id: api
    ammo: {type: uri, file: ammo.uri}
    result: {type: discard}
    gun: {type: http, target: "localhost:8080"}
    rps: {type: const, ops: 10, duration: 1m}
    startup: {type: once, times: 4}
    rps-per-instance: true
"#;

    fn parse(yaml: &str) -> Config {
        let mut cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.assign_pool_ids();
        cfg
    }

    #[test]
    fn test_aliases_and_defaults() {
        let cfg = parse(POOL);
        assert!(cfg.validate().is_ok());
        let pool = &cfg.pools[0];
        assert_eq!(pool.provider.type_name(), "uri");
        assert!(pool.rps_per_instance);
        assert!(!pool.discard_overflow);
        assert_eq!(pool.aggregator.to_string(), "discard");
        assert_eq!(cfg.log, LogConfig::default());
        assert_eq!(cfg.monitoring.expvar.port, 1234);
    }

    #[test]
    fn test_default_pool_ids() {
        let cfg = parse(
            r#"
pools:
  - provider: {type: uri, file: a}
    gun: {type: http, target: "h:1"}
    rps: {type: once, times: 1}
    startup: {type: once, times: 1}
  - provider: {type: uri, file: b}
    gun: {type: http, target: "h:1"}
    rps: {type: once, times: 1}
    startup: {type: once, times: 1}
"#,
        );
        assert_eq!(cfg.pools[0].id, "pool-1");
        assert_eq!(cfg.pools[1].id, "pool-2");
        assert!(matches!(cfg.pools[0].aggregator, AggregatorConfig::Phout(_)));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut cfg = parse(POOL);
        cfg.pools.push(cfg.pools[0].clone());
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("Duplicate pool id"));
    }

    #[test]
    fn test_gun_provider_mismatch() {
        let mut cfg = parse(POOL);
        cfg.pools[0].gun = serde_yaml::from_str("{type: http/scenario, target: \"h:1\"}").unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("gun http/scenario cannot fire http ammo from provider uri"), "{}", err);
    }

    #[test]
    fn test_bad_log_level_and_empty_pools() {
        let mut cfg = parse(POOL);
        cfg.log.level = "loud".to_string();
        assert!(cfg.validate().unwrap_err().contains("Unknown log level"));

        cfg.pools.clear();
        assert!(cfg.validate().unwrap_err().contains("At least one pool"));
    }

    #[test]
    fn test_unknown_plugin_type() {
        let err = serde_yaml::from_str::<Config>(&POOL.replace("type: http,", "type: grpc,")).unwrap_err();
        assert!(err.to_string().contains("grpc"));
    }

    #[test]
    fn test_display() {
        let text = parse(POOL).to_string();
        assert!(text.starts_with("Configuration:\n  Pool api:\n"));
        assert!(text.contains("Rate: const(10, 60s) per instance"));
        assert!(text.contains("Log: info -> stderr"));
    }
}
