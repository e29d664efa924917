//! Ammo providers
//!
//! A [`Provider`] decodes an ammo source on a background task and hands the
//! records to instances through a bounded queue. When the queue is full the
//! decoder suspends, so a slow pool never makes the provider read ahead more
//! than `buffer_size` records.
//!
//! # Lifecycle
//!
//! 1. The pool spawns [`Provider::run`] under its cancellation token
//! 2. Instances call [`Provider::acquire`], which stamps the next ammo ID
//! 3. Finished ammo goes back through [`Provider::release`] for reuse
//!
//! `run` drops the queue sender when it returns, so `acquire` yields `None`
//! once the buffered ammo is drained.
//!
//! # Formats
//!
//! - `uri`: `[Header: value]` lines and `uri [tag]` lines
//! - `uripost`: `<bytes> <uri> [tag]` followed by the body
//! - `raw`: `<bytes> [tag]` followed by a raw HTTP request
//! - `jsonline`: one JSON object per line
//! - `http/scenario`: scenario file, see [`crate::scenario`]

pub mod jsonline;
pub mod raw;
pub mod scenario;
pub mod uri;
pub mod uripost;

use crate::ammo::{Ammo, Payload};
use crate::error::{AmmoDecodeError, ConfigError, PoolError};
use async_trait::async_trait;
use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default capacity of the ammo queue
pub const DEFAULT_BUFFER_SIZE: usize = 128;

/// Provider section of a pool, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProviderConfig {
    #[serde(rename = "uri")]
    Uri(FileProviderConfig),
    #[serde(rename = "uripost")]
    UriPost(FileProviderConfig),
    #[serde(rename = "raw")]
    Raw(FileProviderConfig),
    #[serde(rename = "jsonline")]
    JsonLine(FileProviderConfig),
    #[serde(rename = "http/scenario")]
    HttpScenario(FileProviderConfig),
}

/// Settings shared by every file-backed provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProviderConfig {
    /// Ammo file path
    pub file: PathBuf,

    /// Maximum ammo emitted over the whole run (0 = unlimited)
    #[serde(default)]
    pub limit: u64,

    /// Times to read the source (0 = unlimited)
    #[serde(default)]
    pub passes: u64,

    /// Forward malformed records as invalid ammo instead of failing the pool
    #[serde(default)]
    pub continue_on_error: bool,

    /// Default headers, `[Name: value]` or `Name: value`
    ///
    /// Headers set by the ammo itself take precedence.
    #[serde(default)]
    pub headers: Vec<String>,

    /// Only emit ammo whose tag is in this list (empty = all)
    #[serde(default)]
    pub chosen_cases: Vec<String>,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl FileProviderConfig {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            limit: 0,
            passes: 0,
            continue_on_error: false,
            headers: Vec::new(),
            chosen_cases: Vec::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.file.as_os_str().is_empty() {
            return Err("provider file must be set".to_string());
        }
        if self.buffer_size == 0 {
            return Err("provider buffer_size must be greater than 0".to_string());
        }
        for header in &self.headers {
            parse_header_line(header)?;
        }
        Ok(())
    }

    fn limits(&self) -> Limits {
        Limits {
            limit: self.limit,
            passes: self.passes,
            continue_on_error: self.continue_on_error,
            chosen_cases: self.chosen_cases.clone(),
        }
    }
}

impl ProviderConfig {
    pub fn file_config(&self) -> &FileProviderConfig {
        match self {
            ProviderConfig::Uri(c)
            | ProviderConfig::UriPost(c)
            | ProviderConfig::Raw(c)
            | ProviderConfig::JsonLine(c)
            | ProviderConfig::HttpScenario(c) => c,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ProviderConfig::Uri(_) => "uri",
            ProviderConfig::UriPost(_) => "uripost",
            ProviderConfig::Raw(_) => "raw",
            ProviderConfig::JsonLine(_) => "jsonline",
            ProviderConfig::HttpScenario(_) => "http/scenario",
        }
    }

    /// Payload kind this provider emits
    pub fn payload_kind(&self) -> &'static str {
        match self {
            ProviderConfig::HttpScenario(_) => "scenario",
            _ => "http",
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.file_config().validate()
    }

    /// Build the provider
    ///
    /// Scenario files are parsed here so that schema errors surface before
    /// any pool starts.
    pub fn build(&self) -> Result<Provider, ConfigError> {
        self.validate().map_err(ConfigError::new)?;
        let cfg = self.file_config();
        let defaults = cfg
            .headers
            .iter()
            .map(|h| parse_header_line(h))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ConfigError::new)?;

        let source: Box<dyn AmmoSource> = match self {
            ProviderConfig::Uri(c) => Box::new(FileSource::new(c.file.clone(), Format::Uri)),
            ProviderConfig::UriPost(c) => Box::new(FileSource::new(c.file.clone(), Format::UriPost)),
            ProviderConfig::Raw(c) => Box::new(FileSource::new(c.file.clone(), Format::Raw)),
            ProviderConfig::JsonLine(c) => Box::new(FileSource::new(c.file.clone(), Format::JsonLine)),
            ProviderConfig::HttpScenario(c) => Box::new(scenario::ScenarioSource::load(&c.file)?),
        };

        Ok(Provider::new(source, cfg.limits(), defaults, cfg.buffer_size))
    }
}

impl fmt::Display for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cfg = self.file_config();
        write!(f, "{} ({})", self.type_name(), cfg.file.display())?;
        if cfg.limit > 0 {
            write!(f, ", limit {}", cfg.limit)?;
        }
        if cfg.passes > 0 {
            write!(f, ", passes {}", cfg.passes)?;
        }
        Ok(())
    }
}

/// Parse `[Name: value]` or `Name: value`
pub fn parse_header_line(line: &str) -> Result<(String, String), String> {
    let trimmed = line.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    let (name, value) = inner
        .split_once(':')
        .ok_or_else(|| format!("header {:?} must look like [Name: value]", line))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header {:?} has an empty name", line));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// One pass over an ammo source
///
/// Decoders fill a recycled [`Ammo`] in place. `None` means the pass is over.
/// A decoder that hits an error it cannot skip past (e.g. a broken size
/// prefix) returns the error once and then `None`.
#[async_trait]
pub trait RecordDecoder: Send {
    async fn decode(&mut self, ammo: &mut Ammo) -> Option<Result<(), AmmoDecodeError>>;
}

/// Something that can be read from the start any number of times
#[async_trait]
pub trait AmmoSource: Send + Sync {
    async fn open(&self) -> anyhow::Result<Box<dyn RecordDecoder>>;
}

#[derive(Debug, Clone, Copy)]
enum Format {
    Uri,
    UriPost,
    Raw,
    JsonLine,
}

struct FileSource {
    path: PathBuf,
    format: Format,
}

impl FileSource {
    fn new(path: PathBuf, format: Format) -> Self {
        Self { path, format }
    }
}

pub type Reader = Box<dyn AsyncBufRead + Send + Unpin>;

#[async_trait]
impl AmmoSource for FileSource {
    async fn open(&self) -> anyhow::Result<Box<dyn RecordDecoder>> {
        use anyhow::Context;
        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open ammo file: {}", self.path.display()))?;
        let reader: Reader = Box::new(BufReader::new(file));
        let name = self.path.display().to_string();
        Ok(match self.format {
            Format::Uri => Box::new(uri::UriDecoder::new(reader, name)),
            Format::UriPost => Box::new(uripost::UriPostDecoder::new(reader, name)),
            Format::Raw => Box::new(raw::RawDecoder::new(reader, name)),
            Format::JsonLine => Box::new(jsonline::JsonLineDecoder::new(reader, name)),
        })
    }
}

struct Limits {
    limit: u64,
    passes: u64,
    continue_on_error: bool,
    chosen_cases: Vec<String>,
}

/// Bounded ammo queue plus the decoder that feeds it
pub struct Provider {
    source: Box<dyn AmmoSource>,
    limits: Limits,
    default_headers: Vec<(String, String)>,
    tx: Mutex<Option<mpsc::Sender<Ammo>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Ammo>>,
    next_id: AtomicU64,
    recycled: ArrayQueue<Ammo>,
}

impl Provider {
    fn new(
        source: Box<dyn AmmoSource>,
        limits: Limits,
        default_headers: Vec<(String, String)>,
        buffer_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);
        Self {
            source,
            limits,
            default_headers,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            next_id: AtomicU64::new(0),
            // Room for everything buffered plus what instances hold
            recycled: ArrayQueue::new(buffer_size * 2),
        }
    }

    /// Build a provider around any source, mostly for tests and embedding
    pub fn from_source(source: Box<dyn AmmoSource>, limit: u64, passes: u64, buffer_size: usize) -> Self {
        Self::new(
            source,
            Limits {
                limit,
                passes,
                continue_on_error: false,
                chosen_cases: Vec::new(),
            },
            Vec::new(),
            buffer_size.max(1),
        )
    }

    /// Decode the source into the queue until exhausted, limited or cancelled
    ///
    /// Returns `Ok` on exhaustion, limit and cancellation. Can only be run once.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PoolError> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or_else(|| PoolError::Provider(anyhow::anyhow!("provider is already running")))?;

        let mut emitted = 0u64;
        let mut pass = 0u64;
        'passes: while self.limits.passes == 0 || pass < self.limits.passes {
            let mut decoder = self.source.open().await.map_err(PoolError::Provider)?;
            let mut in_pass = 0u64;

            loop {
                let mut ammo = self.recycled.pop().unwrap_or_default();
                let decoded = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    decoded = decoder.decode(&mut ammo) => decoded,
                };
                match decoded {
                    None => break,
                    Some(Ok(())) => {
                        if !self.limits.chosen_cases.is_empty()
                            && !self.limits.chosen_cases.contains(&ammo.tag)
                        {
                            self.release(ammo);
                            continue;
                        }
                        if let Payload::Http(ref mut req) = ammo.payload {
                            req.apply_default_headers(&self.default_headers);
                        }
                    }
                    Some(Err(err)) => {
                        if !self.limits.continue_on_error {
                            return Err(err.into());
                        }
                        warn!(error = %err, "Forwarding invalid ammo");
                        ammo.reset();
                        ammo.invalid = Some(err.to_string());
                    }
                }

                in_pass += 1;
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    sent = tx.send(ammo) => {
                        if sent.is_err() {
                            // Every receiver is gone; nobody wants more ammo
                            return Ok(());
                        }
                    }
                }
                emitted += 1;
                if self.limits.limit > 0 && emitted >= self.limits.limit {
                    debug!(emitted, "Ammo limit reached");
                    break 'passes;
                }
            }

            if in_pass == 0 {
                return Err(PoolError::Provider(anyhow::anyhow!(
                    "ammo source yielded no ammo in pass {}",
                    pass + 1
                )));
            }
            pass += 1;
        }

        debug!(emitted, passes = pass, "Provider finished");
        Ok(())
    }

    /// Next ammo with a fresh ID, or `None` once the provider is drained
    ///
    /// Cancel-safe: dropping the future never loses ammo.
    pub async fn acquire(&self) -> Option<Ammo> {
        let mut rx = self.rx.lock().await;
        let mut ammo = rx.recv().await?;
        ammo.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Some(ammo)
    }

    /// Give an ammo back for reuse
    pub fn release(&self, mut ammo: Ammo) {
        ammo.reset();
        let _ = self.recycled.push(ammo);
    }

    /// Number of ammo handed out so far
    pub fn acquired(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }
}

/// Split an absolute URL into `(host, path)`; relative URIs pass through
pub(crate) fn split_absolute_uri(uri: &str) -> (Option<String>, String) {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = uri.strip_prefix(scheme) {
            return match rest.find('/') {
                Some(i) => (Some(rest[..i].to_string()), rest[i..].to_string()),
                None => (Some(rest.to_string()), "/".to_string()),
            };
        }
    }
    (None, uri.to_string())
}
