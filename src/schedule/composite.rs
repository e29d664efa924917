//! Concatenation of schedules
//!
//! Each part starts at the finish instant of the previous one rather than at
//! the wall-clock moment of the switch. A `once(n)` followed by a `const` keeps
//! the burst at the origin and the `const` tokens on their original grid.

use super::{Schedule, ScheduleConfig};
use crate::error::ConfigError;
use std::sync::{Mutex, PoisonError};
use tokio::time::Instant;

pub struct Composite {
    parts: Vec<Box<dyn Schedule>>,
    state: Mutex<State>,
}

struct State {
    started: bool,
    current: usize,
}

impl Composite {
    pub fn new(parts: Vec<Box<dyn Schedule>>) -> Self {
        Self {
            parts,
            state: Mutex::new(State {
                started: false,
                current: 0,
            }),
        }
    }

    pub fn from_configs(steps: &[ScheduleConfig]) -> Result<Self, ConfigError> {
        if steps.is_empty() {
            return Err(ConfigError::new("composite schedule must have at least one step"));
        }
        let parts = steps
            .iter()
            .map(ScheduleConfig::build)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(parts))
    }

    fn start_locked(&self, state: &mut State, origin: Instant) {
        if state.started {
            return;
        }
        state.started = true;
        if let Some(first) = self.parts.first() {
            first.start(origin);
        }
    }
}

impl Schedule for Composite {
    fn start(&self, origin: Instant) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.start_locked(&mut state, origin);
    }

    fn next(&self) -> Option<Instant> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.started {
            self.start_locked(&mut state, Instant::now());
        }
        while let Some(part) = self.parts.get(state.current) {
            if let Some(at) = part.next() {
                return Some(at);
            }
            let finish = part.finish().unwrap_or_else(Instant::now);
            state.current += 1;
            if let Some(following) = self.parts.get(state.current) {
                following.start(finish);
            }
        }
        None
    }

    fn left(&self) -> i64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut total = 0i64;
        for part in &self.parts[state.current.min(self.parts.len())..] {
            let left = part.left();
            if left < 0 {
                return -1;
            }
            total += left;
        }
        total
    }

    fn finish(&self) -> Option<Instant> {
        self.parts.last().and_then(|p| p.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::do_at::DoAt;
    use crate::schedule::drain_offsets;
    use crate::schedule::once::Once;
    use crate::schedule::unlimited::Unlimited;
    use std::time::Duration;

    #[test]
    fn test_origin_chains_through_finish() {
        let sched = Composite::new(vec![
            Box::new(DoAt::constant(2.0, Duration::from_secs(1))),
            Box::new(Once::new(1)),
            Box::new(DoAt::constant(1.0, Duration::from_secs(2))),
        ]);
        let origin = Instant::now();
        sched.start(origin);
        assert_eq!(sched.left(), 5);
        let offsets = drain_offsets(&sched, origin);
        let secs = |ms: u64| Duration::from_millis(ms);
        assert_eq!(offsets, vec![secs(0), secs(500), secs(1000), secs(1000), secs(2000)]);
        assert_eq!(sched.finish(), Some(origin + Duration::from_secs(3)));
    }

    #[test]
    fn test_left_unknown_with_unlimited_part() {
        let sched = Composite::new(vec![
            Box::new(Once::new(3)),
            Box::new(Unlimited::new(Duration::from_secs(1))),
        ]);
        assert_eq!(sched.left(), -1);
    }

    #[test]
    fn test_empty_config_rejected() {
        assert!(Composite::from_configs(&[]).is_err());
    }
}
