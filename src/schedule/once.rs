//! Burst of tokens at the origin

use super::Schedule;
use std::sync::{Mutex, PoisonError};
use tokio::time::Instant;

/// `times` tokens, all equal to the origin
pub struct Once {
    times: u64,
    state: Mutex<(Option<Instant>, u64)>,
}

impl Once {
    pub fn new(times: u64) -> Self {
        Self {
            times,
            state: Mutex::new((None, 0)),
        }
    }
}

impl Schedule for Once {
    fn start(&self, origin: Instant) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.0.get_or_insert(origin);
    }

    fn next(&self) -> Option<Instant> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let origin = *state.0.get_or_insert_with(Instant::now);
        if state.1 >= self.times {
            return None;
        }
        state.1 += 1;
        Some(origin)
    }

    fn left(&self) -> i64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (self.times - state.1) as i64
    }

    fn finish(&self) -> Option<Instant> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).0
    }
}
