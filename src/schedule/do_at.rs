//! Schedules whose k-th token is a pure function of k

use super::Schedule;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

type OffsetFn = Box<dyn Fn(u64) -> Duration + Send + Sync>;

/// `total` tokens, token `i` fired at `origin + do_at(i)`
pub struct DoAt {
    duration: Duration,
    total: u64,
    do_at: OffsetFn,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    origin: Option<Instant>,
    i: u64,
}

// Guards against `4.0 * 0.5 = 1.9999999` style truncation
const COUNT_EPSILON: f64 = 1e-9;

impl DoAt {
    pub fn new(duration: Duration, total: u64, do_at: OffsetFn) -> Self {
        Self {
            duration,
            total,
            do_at,
            state: Mutex::new(State::default()),
        }
    }

    /// `floor(ops * duration)` tokens spaced `1/ops` apart
    pub fn constant(ops: f64, duration: Duration) -> Self {
        if ops <= 0.0 {
            return Self::new(duration, 0, Box::new(|_| Duration::ZERO));
        }
        let total = (ops * duration.as_secs_f64() + COUNT_EPSILON).floor() as u64;
        Self::new(
            duration,
            total,
            Box::new(move |i| Duration::from_secs_f64(i as f64 / ops)),
        )
    }

    /// RPS growing linearly from `from` to `to` over `duration`
    ///
    /// Token `i` fires at the positive root of `(a/2)t² + from·t = i` where
    /// `a = (to - from) / duration`.
    pub fn line(from: f64, to: f64, duration: Duration) -> Self {
        let secs = duration.as_secs_f64();
        let a = (to - from) / secs;
        let total = (a * secs * secs / 2.0 + from * secs + COUNT_EPSILON).floor().max(0.0) as u64;

        let offset = move |i: u64| -> Duration {
            let i = i as f64;
            let t = if a == 0.0 {
                i / from
            } else {
                let disc = (from * from + 2.0 * a * i).max(0.0);
                (disc.sqrt() - from) / a
            };
            Duration::from_secs_f64(t.clamp(0.0, secs))
        };
        Self::new(duration, total, Box::new(offset))
    }

    /// `count` tokens spread evenly over `duration`, the first at the origin
    pub fn spread(count: u64, duration: Duration) -> Self {
        let nanos = duration.as_nanos();
        Self::new(
            duration,
            count,
            Box::new(move |i| {
                let off = nanos * i as u128 / count.max(1) as u128;
                Duration::from_nanos(off as u64)
            }),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Schedule for DoAt {
    fn start(&self, origin: Instant) {
        let mut state = self.lock();
        if state.origin.is_none() {
            state.origin = Some(origin);
        }
    }

    fn next(&self) -> Option<Instant> {
        let mut state = self.lock();
        let origin = *state.origin.get_or_insert_with(Instant::now);
        if state.i >= self.total {
            return None;
        }
        let at = origin + (self.do_at)(state.i);
        state.i += 1;
        Some(at)
    }

    fn left(&self) -> i64 {
        let state = self.lock();
        self.total.saturating_sub(state.i) as i64
    }

    fn finish(&self) -> Option<Instant> {
        self.lock().origin.map(|origin| origin + self.duration)
    }
}
