//! Error taxonomy
//!
//! Library modules return these typed errors; the CLI wraps them in `anyhow`
//! with context. Recoverable failures (transport errors, assertion failures,
//! invalid ammo) never show up here: guns turn them into samples, see
//! [`crate::sample::SampleError`].

use std::fmt;
use thiserror::Error;

/// Invalid schema, unknown plugin or out-of-range parameter
///
/// Always reported before any pool starts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("config error: {0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<String> for ConfigError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

/// Malformed ammo record
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("ammo decode error at {location}: {message}")]
pub struct AmmoDecodeError {
    /// Human readable position, e.g. `ammo.uri:12`
    pub location: String,
    pub message: String,
}

impl AmmoDecodeError {
    pub fn new(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            message: message.into(),
        }
    }
}

/// Failure of a single pool
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    AmmoDecode(#[from] AmmoDecodeError),

    #[error("provider failed: {0:#}")]
    Provider(anyhow::Error),

    #[error("aggregator failed: {0:#}")]
    Aggregator(anyhow::Error),

    #[error("gun warm up failed: {0:#}")]
    WarmUp(anyhow::Error),

    #[error("instance {instance_id} failed: {reason}")]
    FatalInstance { instance_id: usize, reason: String },

    #[error("startup schedule produced no instances")]
    NoInstances,

    #[error("pool task panicked: {0}")]
    Panicked(String),

    #[error("pool cancelled")]
    Cancelled,

    #[error("pool did not stop within {0:?} after cancellation")]
    ShutdownTimeout(std::time::Duration),
}

impl PoolError {
    /// Cancellation caused by someone else is not a user-visible failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PoolError::Cancelled)
    }
}

/// Composite error returned by the engine: one entry per failed pool
#[derive(Debug, Error)]
pub struct EngineError {
    pub failures: Vec<(String, PoolError)>,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pool(s) failed", self.failures.len())?;
        for (pool_id, err) in &self.failures {
            write!(f, "; pool {:?}: {}", pool_id, err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_lists_every_pool() {
        let err = EngineError {
            failures: vec![
                ("a".to_string(), PoolError::NoInstances),
                (
                    "b".to_string(),
                    PoolError::FatalInstance {
                        instance_id: 3,
                        reason: "gun panicked".to_string(),
                    },
                ),
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("2 pool(s) failed"));
        assert!(text.contains("pool \"a\": startup schedule produced no instances"));
        assert!(text.contains("instance 3 failed: gun panicked"));
    }

    #[test]
    fn test_decode_error_display() {
        let err = AmmoDecodeError::new("ammo.uri:4", "bad header line");
        assert_eq!(err.to_string(), "ammo decode error at ammo.uri:4: bad header line");
    }
}
