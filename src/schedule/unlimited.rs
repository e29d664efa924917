//! No rate limit for a fixed duration

use super::Schedule;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Returns the origin on every call until `duration` has elapsed
pub struct Unlimited {
    duration: Duration,
    origin: Mutex<Option<Instant>>,
}

impl Unlimited {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            origin: Mutex::new(None),
        }
    }
}

impl Schedule for Unlimited {
    fn start(&self, origin: Instant) {
        self.origin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(origin);
    }

    fn next(&self) -> Option<Instant> {
        let origin = *self
            .origin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(Instant::now);
        if Instant::now() >= origin + self.duration {
            return None;
        }
        Some(origin)
    }

    fn left(&self) -> i64 {
        -1
    }

    fn finish(&self) -> Option<Instant> {
        self.origin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|origin| origin + self.duration)
    }
}
