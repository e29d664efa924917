//! Gun contract
//!
//! A gun turns one ammo into one shot and reports one or more samples. Guns
//! are created per instance by a [`GunFactory`]; the factory's
//! [`GunFactory::warm_up`] runs once per pool before any instance starts and
//! its result is handed to every gun of that pool.
//!
//! Guns never fail a shot: transport errors, timeouts and assertion failures
//! all become error samples. Panics are caught by the instance loop.

pub mod http;

use crate::aggregator::Reporter;
use crate::ammo::Ammo;
use crate::config::duration;
use crate::error::ConfigError;
use crate::sample::{Sample, SampleError};
use crate::scenario::gun::ScenarioGunFactory;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default shot timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Value produced by warm up and shared by every gun of a pool
pub type SharedState = Arc<dyn Any + Send + Sync>;

/// Everything a gun is bound to
#[derive(Clone)]
pub struct GunDeps {
    pub pool_id: String,
    pub instance_id: usize,
    /// Pool token; cancelling it aborts in-flight shots
    pub cancel: CancellationToken,
    pub span: tracing::Span,
    pub reporter: Reporter,
    pub shared: SharedState,
}

#[async_trait]
pub trait Gun: Send {
    /// Fire one ammo and report its samples
    async fn shoot(&mut self, ammo: &Ammo);
}

#[async_trait]
pub trait GunFactory: Send + Sync {
    /// Whether this gun can shoot ammo of the given payload kind
    fn accepts(&self, payload_kind: &str) -> bool;

    /// One-time setup per pool; failure fails the pool before any shot
    async fn warm_up(&self, cancel: &CancellationToken) -> anyhow::Result<SharedState>;

    fn new_gun(&self, deps: GunDeps) -> anyhow::Result<Box<dyn Gun>>;
}

/// Gun section of a pool, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum GunConfig {
    #[serde(rename = "http")]
    Http(HttpGunConfig),
    #[serde(rename = "http2")]
    Http2(HttpGunConfig),
    #[serde(rename = "http/scenario")]
    HttpScenario(HttpGunConfig),
}

/// Settings of every HTTP-based gun
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpGunConfig {
    /// `host:port` every request is sent to
    pub target: String,

    #[serde(default)]
    pub ssl: bool,

    #[serde(default = "default_timeout", with = "duration")]
    pub timeout: Duration,

    #[serde(default = "default_connect_timeout", with = "duration", alias = "connect-timeout")]
    pub connect_timeout: Duration,

    /// Skip TLS certificate verification
    ///
    /// Defaults to `true`. Set `insecure: false` to verify certificates
    /// against the system roots.
    #[serde(default = "default_insecure")]
    pub insecure: bool,

    #[serde(default, alias = "autotag", alias = "auto-tag")]
    pub auto_tag: AutoTagConfig,
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_insecure() -> bool {
    true
}

/// Tag untagged ammo with the first URI path segments
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoTagConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_uri_elements", alias = "uri-elements")]
    pub uri_elements: usize,

    /// Keep tags that are already set
    #[serde(default = "default_no_tag_only", alias = "no-tag-only")]
    pub no_tag_only: bool,
}

fn default_uri_elements() -> usize {
    2
}

fn default_no_tag_only() -> bool {
    true
}

impl Default for AutoTagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            uri_elements: default_uri_elements(),
            no_tag_only: default_no_tag_only(),
        }
    }
}

impl HttpGunConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ssl: false,
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: default_connect_timeout(),
            insecure: true,
            auto_tag: AutoTagConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.target.is_empty() {
            return Err("gun target must be set".to_string());
        }
        if self.target.contains("://") || self.target.contains('/') {
            return Err(format!("gun target {:?} must be host:port", self.target));
        }
        if self.timeout.is_zero() {
            return Err("gun timeout must be greater than 0".to_string());
        }
        if self.auto_tag.enabled && self.auto_tag.uri_elements == 0 {
            return Err("auto_tag uri_elements must be greater than 0".to_string());
        }
        Ok(())
    }

    /// `scheme://target` prefix for request URIs
    pub fn base_url(&self) -> String {
        format!("{}://{}", if self.ssl { "https" } else { "http" }, self.target)
    }
}

impl GunConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            GunConfig::Http(_) => "http",
            GunConfig::Http2(_) => "http2",
            GunConfig::HttpScenario(_) => "http/scenario",
        }
    }

    pub fn http_config(&self) -> &HttpGunConfig {
        match self {
            GunConfig::Http(c) | GunConfig::Http2(c) | GunConfig::HttpScenario(c) => c,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.http_config().validate()
    }

    pub fn build(&self) -> Result<Arc<dyn GunFactory>, ConfigError> {
        self.validate().map_err(ConfigError::new)?;
        Ok(match self {
            GunConfig::Http(c) => Arc::new(http::HttpGunFactory::new(c.clone(), http::Protocol::Http1)),
            GunConfig::Http2(c) => Arc::new(http::HttpGunFactory::new(c.clone(), http::Protocol::Http2)),
            GunConfig::HttpScenario(c) => Arc::new(ScenarioGunFactory::new(c.clone())),
        })
    }
}

impl fmt::Display for GunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.http_config();
        write!(f, "{} -> {}", self.type_name(), c.base_url())?;
        if c.timeout != DEFAULT_TIMEOUT {
            write!(f, " (timeout {:?})", c.timeout)?;
        }
        Ok(())
    }
}

/// Report an error sample for ammo the gun cannot fire
pub(crate) async fn report_unfired(reporter: &Reporter, ammo: &Ammo, error: SampleError) {
    let mut sample = Sample::start(ammo.tag.clone());
    sample.set_error(error);
    sample.finish();
    reporter.report(sample).await;
}
