//! Config file parsing
//!
//! The format is picked by extension: `.json`, `.toml`, otherwise YAML.

use super::Config;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
    Toml,
}

impl Format {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "json" => Ok(Format::Json),
            "toml" => Ok(Format::Toml),
            "hcl" => bail!("HCL configs are not supported, convert {} to YAML", path.display()),
            _ => Ok(Format::Yaml),
        }
    }
}

/// Read, parse and validate a config file
pub fn load(path: &Path) -> Result<Config> {
    let format = Format::from_path(path)?;
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_str(&contents, format).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse and validate config text
pub fn parse_str(contents: &str, format: Format) -> Result<Config> {
    let mut config: Config = match format {
        Format::Yaml => serde_yaml::from_str(contents).context("Invalid YAML configuration")?,
        Format::Json => serde_json::from_str(contents).context("Invalid JSON configuration")?,
        Format::Toml => ::toml::from_str(contents).context("Invalid TOML configuration")?,
    };
    config.assign_pool_ids();
    if let Err(e) = config.validate() {
        bail!("Invalid configuration: {}", e);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    const TOML: &str = r#"
[log]
level = "debug"

[[pools]]
id = "toml-pool"
provider = { type = "jsonline", file = "ammo.jsonl", limit = 100 }
gun = { type = "http2", target = "example.com:443", ssl = true }
aggregator = { type = "log" }
rps = [{ type = "line", from = 1, to = 10, duration = "10s" }, { type = "const", ops = 10, duration = "1m" }]
startup = { type = "once", times = 8 }
"#;

    #[test]
    fn test_format_by_extension() {
        assert_eq!(Format::from_path(Path::new("a.yml")).unwrap(), Format::Yaml);
        assert_eq!(Format::from_path(Path::new("a.JSON")).unwrap(), Format::Json);
        assert_eq!(Format::from_path(Path::new("a.toml")).unwrap(), Format::Toml);
        assert_eq!(Format::from_path(Path::new("noext")).unwrap(), Format::Yaml);
        assert!(Format::from_path(Path::new("load.hcl")).is_err());
    }

    #[test]
    fn test_toml_config() {
        let cfg = parse_str(TOML, Format::Toml).unwrap();
        assert_eq!(cfg.log.level, "debug");
        let pool = &cfg.pools[0];
        assert_eq!(pool.id, "toml-pool");
        assert_eq!(pool.gun.type_name(), "http2");
        assert!(pool.rps.to_string().starts_with("[line(1, 10, 10s), const(10, 60s)"));
    }

    #[test]
    fn test_json_config() {
        let json = r#"{"pools": [{
            "ammo": {"type": "uri", "file": "a.uri"},
            "gun": {"type": "http", "target": "localhost:80"},
            "rps": {"type": "unlimited", "duration": "5s"},
            "startup": {"type": "once", "times": 1}
        }], "monitoring": {"expvar": {"enabled": true, "port": 9000}}}"#;
        let cfg = parse_str(json, Format::Json).unwrap();
        assert_eq!(cfg.pools[0].id, "pool-1");
        assert!(cfg.monitoring.expvar.enabled);
        assert_eq!(cfg.monitoring.expvar.port, 9000);
    }

    #[test]
    fn test_load_reports_path() {
        let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "pools: []").unwrap();
        let err = load(file.path()).unwrap_err();
        let text = format!("{:#}", err);
        assert!(text.contains("Failed to parse config file"));
        assert!(text.contains("At least one pool"));

        let err = load(Path::new("/nonexistent/load.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
