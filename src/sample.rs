//! Measurement records produced by guns
//!
//! A [`Sample`] is filled by a gun while a shot is in flight and moved into the
//! aggregator on report. Sub-phase durations are optional; guns that cannot
//! observe them leave zeros.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Network code written for any failed shot
pub const NET_CODE_ERROR: u16 = 999;

/// Protocol code written for any failed shot
pub const PROTO_CODE_ERROR: u16 = 500;

/// Why a shot did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    /// Network failure inside the gun (connect, TLS, reset, ...)
    Transport(String),
    /// The shot exceeded the gun timeout
    Timeout(Duration),
    /// `assert/response` mismatch in a scenario step
    Assertion(String),
    /// Provider could not decode the ammo but was told to continue
    InvalidAmmo(String),
    /// Ammo payload of a kind this gun does not shoot
    UnsupportedAmmo(&'static str),
    /// Scenario composition failure (template, preprocessor, postprocessor)
    Scenario(String),
    /// The gun panicked
    Panic(String),
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleError::Transport(msg) => write!(f, "transport: {}", msg),
            SampleError::Timeout(d) => write!(f, "timeout after {:?}", d),
            SampleError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
            SampleError::InvalidAmmo(msg) => write!(f, "invalid ammo: {}", msg),
            SampleError::UnsupportedAmmo(kind) => write!(f, "unsupported ammo payload: {}", kind),
            SampleError::Scenario(msg) => write!(f, "scenario: {}", msg),
            SampleError::Panic(msg) => write!(f, "gun panic: {}", msg),
        }
    }
}

/// One measurement record
#[derive(Debug, Clone)]
pub struct Sample {
    /// Wall-clock time the shot started
    pub timestamp: DateTime<Utc>,
    started: Instant,
    /// Total shot duration (monotonic)
    pub elapsed: Duration,
    pub tag: String,
    /// HTTP status; 0 when no response was received
    pub proto_code: u16,
    pub error: Option<SampleError>,
    /// Left at zero by the HTTP guns; the client does not expose it
    pub connect: Duration,
    /// Left at zero by the HTTP guns; the client does not expose it
    pub send: Duration,
    /// Time from request sent to first response byte
    pub latency: Duration,
    pub receive: Duration,
    /// Request bytes written
    pub egress: u64,
    /// Response bytes read
    pub igress: u64,
}

impl Sample {
    /// Acquire a sample at the start of a shot
    pub fn start(tag: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            started: Instant::now(),
            elapsed: Duration::ZERO,
            tag: tag.into(),
            proto_code: 0,
            error: None,
            connect: Duration::ZERO,
            send: Duration::ZERO,
            latency: Duration::ZERO,
            receive: Duration::ZERO,
            egress: 0,
            igress: 0,
        }
    }

    /// Monotonic instant the shot started
    pub fn started_at(&self) -> Instant {
        self.started
    }

    /// Stamp the elapsed duration; call once the shot is over
    pub fn finish(&mut self) {
        self.elapsed = self.started.elapsed();
    }

    pub fn set_error(&mut self, err: SampleError) {
        self.error = Some(err);
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Network code for phout: 0 on success, 999 on error
    pub fn net_code(&self) -> u16 {
        if self.error.is_some() {
            NET_CODE_ERROR
        } else {
            0
        }
    }

    /// Protocol code for phout: 500 on error, else the observed status
    pub fn phout_proto_code(&self) -> u16 {
        if self.error.is_some() {
            PROTO_CODE_ERROR
        } else {
            self.proto_code
        }
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tag={} code={} rt={}us",
            if self.tag.is_empty() { "-" } else { &self.tag },
            self.proto_code,
            self.elapsed.as_micros()
        )?;
        if let Some(ref err) = self.error {
            write!(f, " error={}", err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_on_success() {
        let mut sample = Sample::start("ok");
        sample.proto_code = 204;
        sample.finish();
        assert_eq!(sample.net_code(), 0);
        assert_eq!(sample.phout_proto_code(), 204);
        assert!(sample.is_ok());
    }

    #[test]
    fn test_codes_on_error() {
        let mut sample = Sample::start("bad");
        sample.proto_code = 401;
        sample.set_error(SampleError::Assertion("status 401 != 200".to_string()));
        assert_eq!(sample.net_code(), NET_CODE_ERROR);
        assert_eq!(sample.phout_proto_code(), PROTO_CODE_ERROR);
        assert!(sample.to_string().contains("assertion failed: status 401 != 200"));
    }
}
