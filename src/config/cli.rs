//! CLI argument parsing using clap

use super::Config;
use clap::Parser;
use std::path::PathBuf;

/// loadtool - rate-planned load generator
#[derive(Parser, Debug)]
#[command(name = "loadtool")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file (.yaml, .yml, .json or .toml)
    #[arg(value_name = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Print an example config and exit
    #[arg(long)]
    pub example: bool,

    /// List registered providers, guns, aggregators and schedules, then exit
    #[arg(long)]
    pub plugins: bool,

    /// Serve pool counters as JSON on /debug/vars
    #[arg(long)]
    pub expvar: bool,

    /// Port for --expvar (default 1234 or monitoring.expvar.port)
    #[arg(long, value_name = "PORT")]
    pub expvar_port: Option<u16>,

    /// Log level override: trace, debug, info, warn, error
    #[arg(long, env = "LOADTOOL_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.example || self.plugins {
            return Ok(());
        }
        if self.config.is_none() {
            anyhow::bail!("a config file is required (try --example)");
        }
        if self.expvar_port == Some(0) {
            anyhow::bail!("expvar port must be greater than 0");
        }
        Ok(())
    }

    /// Apply CLI overrides to a loaded config (CLI takes precedence)
    pub fn merge_into(&self, config: &mut Config) {
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if self.expvar {
            config.monitoring.expvar.enabled = true;
        }
        if let Some(port) = self.expvar_port {
            config.monitoring.expvar.port = port;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::example::EXAMPLE_YAML;

    #[test]
    fn test_config_required_unless_example() {
        let cli = Cli::try_parse_from(["loadtool"]).unwrap();
        assert!(cli.validate().is_err());

        let cli = Cli::try_parse_from(["loadtool", "--example"]).unwrap();
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::try_parse_from([
            "loadtool",
            "load.yaml",
            "--expvar",
            "--expvar-port",
            "9100",
            "--log-level",
            "debug",
        ])
        .unwrap();
        cli.validate().unwrap();
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("load.yaml")));

        let mut config: Config = serde_yaml::from_str(EXAMPLE_YAML).unwrap();
        assert!(!config.monitoring.expvar.enabled);
        cli.merge_into(&mut config);
        assert!(config.monitoring.expvar.enabled);
        assert_eq!(config.monitoring.expvar.port, 9100);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_zero_port_rejected() {
        let cli = Cli::try_parse_from(["loadtool", "a.yaml", "--expvar-port", "0"]).unwrap();
        assert!(cli.validate().is_err());
    }
}
