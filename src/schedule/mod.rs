//! Rate plans
//!
//! A [`Schedule`] is a lazy, non-decreasing sequence of instants at which an
//! event is permitted: firing one request for a pool's rate schedule, spawning
//! one instance for its startup schedule.
//!
//! # Primitives
//!
//! - **once**: `times` tokens at the origin
//! - **const**: uniform spacing `1/ops` for `duration`
//! - **line**: linear RPS ramp from `from` to `to` over `duration`
//! - **step**: piecewise constant ramp built from `const` segments
//! - **instance_step / instance_const**: startup plans
//! - **unlimited**: the origin on every call until `duration` elapses
//! - **composite**: concatenation; each part starts where the previous finished
//!
//! # Example
//!
//! ```
//! use loadtool::schedule::{Schedule, once::Once};
//! use tokio::time::Instant;
//!
//! let origin = Instant::now();
//! let sched = Once::new(2);
//! sched.start(origin);
//! assert_eq!(sched.next(), Some(origin));
//! assert_eq!(sched.next(), Some(origin));
//! assert_eq!(sched.next(), None);
//! ```

pub mod composite;
pub mod do_at;
pub mod once;
pub mod unlimited;

use crate::config::duration;
use crate::error::ConfigError;
use composite::Composite;
use do_at::DoAt;
use once::Once;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use unlimited::Unlimited;

/// Sequence of permitted event instants
///
/// Implementations are shared between tasks, so every method takes `&self`
/// and guards its cursor internally.
pub trait Schedule: Send + Sync {
    /// Bind the origin. Only the first call has an effect.
    fn start(&self, origin: Instant);

    /// Next permitted instant, or `None` once the plan is over
    ///
    /// Binds the origin to now if [`Schedule::start`] was never called.
    fn next(&self) -> Option<Instant>;

    /// Tokens left, negative when unknown or infinite
    fn left(&self) -> i64;

    /// Instant this plan ends, known once started
    ///
    /// Composite schedules start the following part at this instant.
    fn finish(&self) -> Option<Instant>;
}

/// A single primitive plan, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleConfig {
    Once {
        times: u64,
    },
    Const {
        ops: f64,
        #[serde(with = "duration")]
        duration: Duration,
    },
    Line {
        from: f64,
        to: f64,
        #[serde(with = "duration")]
        duration: Duration,
    },
    Step {
        from: f64,
        to: f64,
        step: f64,
        #[serde(with = "duration")]
        duration: Duration,
    },
    #[serde(alias = "instances_step")]
    InstanceStep {
        from: u64,
        to: u64,
        step: u64,
        #[serde(with = "duration", alias = "stepduration")]
        step_duration: Duration,
    },
    #[serde(alias = "instances_const")]
    InstanceConst {
        count: u64,
        #[serde(with = "duration")]
        duration: Duration,
    },
    Unlimited {
        #[serde(with = "duration")]
        duration: Duration,
    },
    Composite {
        steps: Vec<ScheduleConfig>,
    },
}

/// `rps` / `startup` value: one plan or a list read as a composite
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SchedulePlan {
    One(ScheduleConfig),
    Many(Vec<ScheduleConfig>),
}

impl SchedulePlan {
    /// Build a fresh schedule from this plan
    pub fn build(&self) -> Result<Arc<dyn Schedule>, ConfigError> {
        match self {
            SchedulePlan::One(cfg) => Ok(Arc::from(cfg.build()?)),
            SchedulePlan::Many(steps) => Ok(Arc::new(Composite::from_configs(steps)?)),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            SchedulePlan::One(cfg) => cfg.validate(),
            SchedulePlan::Many(steps) => {
                if steps.is_empty() {
                    return Err("schedule list must not be empty".to_string());
                }
                for (i, step) in steps.iter().enumerate() {
                    step.validate().map_err(|e| format!("step {}: {}", i, e))?;
                }
                Ok(())
            }
        }
    }
}

impl ScheduleConfig {
    /// Validate parameters without building
    pub fn validate(&self) -> Result<(), String> {
        fn rate(name: &str, v: f64) -> Result<(), String> {
            if !v.is_finite() || v < 0.0 {
                return Err(format!("{} must be a non-negative number, got {}", name, v));
            }
            Ok(())
        }
        fn nonzero(d: Duration) -> Result<(), String> {
            if d.is_zero() {
                return Err("duration must be greater than 0".to_string());
            }
            Ok(())
        }

        match self {
            ScheduleConfig::Once { .. } => Ok(()),
            ScheduleConfig::Const { ops, duration } => {
                rate("ops", *ops)?;
                nonzero(*duration)
            }
            ScheduleConfig::Line { from, to, duration } => {
                rate("from", *from)?;
                rate("to", *to)?;
                nonzero(*duration)
            }
            ScheduleConfig::Step { from, to, step, duration } => {
                rate("from", *from)?;
                rate("to", *to)?;
                rate("step", *step)?;
                if *step == 0.0 {
                    return Err("step must be greater than 0".to_string());
                }
                nonzero(*duration)
            }
            ScheduleConfig::InstanceStep { step, step_duration, .. } => {
                if *step == 0 {
                    return Err("step must be greater than 0".to_string());
                }
                nonzero(*step_duration)
            }
            ScheduleConfig::InstanceConst { duration, .. } => nonzero(*duration),
            ScheduleConfig::Unlimited { duration } => nonzero(*duration),
            ScheduleConfig::Composite { steps } => {
                SchedulePlan::Many(steps.clone()).validate()
            }
        }
    }

    /// Build the schedule this config describes
    pub fn build(&self) -> Result<Box<dyn Schedule>, ConfigError> {
        self.validate().map_err(ConfigError::new)?;

        let sched: Box<dyn Schedule> = match self {
            ScheduleConfig::Once { times } => Box::new(Once::new(*times)),
            ScheduleConfig::Const { ops, duration } => Box::new(DoAt::constant(*ops, *duration)),
            ScheduleConfig::Line { from, to, duration } => {
                Box::new(DoAt::line(*from, *to, *duration))
            }
            ScheduleConfig::Step { from, to, step, duration } => {
                Box::new(Composite::new(step_parts(*from, *to, *step, *duration)))
            }
            ScheduleConfig::InstanceStep { from, to, step, step_duration } => {
                Box::new(Composite::new(instance_step_parts(*from, *to, *step, *step_duration)))
            }
            ScheduleConfig::InstanceConst { count, duration } => {
                Box::new(DoAt::spread(*count, *duration))
            }
            ScheduleConfig::Unlimited { duration } => Box::new(Unlimited::new(*duration)),
            ScheduleConfig::Composite { steps } => Box::new(Composite::from_configs(steps)?),
        };
        Ok(sched)
    }
}

fn step_parts(from: f64, to: f64, step: f64, duration: Duration) -> Vec<Box<dyn Schedule>> {
    let mut parts: Vec<Box<dyn Schedule>> = Vec::new();
    // Tolerate accumulated float error on the last step
    let eps = step * 1e-9;
    if from <= to {
        let mut r = from;
        while r <= to + eps {
            parts.push(Box::new(DoAt::constant(r, duration)));
            r += step;
        }
    } else {
        let mut r = from;
        while r >= to - eps {
            parts.push(Box::new(DoAt::constant(r, duration)));
            r -= step;
        }
    }
    parts
}

fn instance_step_parts(from: u64, to: u64, step: u64, step_duration: Duration) -> Vec<Box<dyn Schedule>> {
    let mut parts: Vec<Box<dyn Schedule>> = vec![Box::new(Once::new(from))];
    let mut current = from + step;
    while current <= to {
        parts.push(Box::new(DoAt::constant(0.0, step_duration)));
        parts.push(Box::new(Once::new(step)));
        current += step;
    }
    parts
}

impl fmt::Display for ScheduleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleConfig::Once { times } => write!(f, "once({})", times),
            ScheduleConfig::Const { ops, duration } => write!(f, "const({}, {:?})", ops, duration),
            ScheduleConfig::Line { from, to, duration } => {
                write!(f, "line({}, {}, {:?})", from, to, duration)
            }
            ScheduleConfig::Step { from, to, step, duration } => {
                write!(f, "step({}, {}, {}, {:?})", from, to, step, duration)
            }
            ScheduleConfig::InstanceStep { from, to, step, step_duration } => {
                write!(f, "instance_step({}, {}, {}, {:?})", from, to, step, step_duration)
            }
            ScheduleConfig::InstanceConst { count, duration } => {
                write!(f, "instance_const({}, {:?})", count, duration)
            }
            ScheduleConfig::Unlimited { duration } => write!(f, "unlimited({:?})", duration),
            ScheduleConfig::Composite { steps } => {
                write!(f, "[")?;
                for (i, s) in steps.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", s)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl fmt::Display for SchedulePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulePlan::One(cfg) => write!(f, "{}", cfg),
            SchedulePlan::Many(steps) => {
                write!(f, "{}", ScheduleConfig::Composite { steps: steps.clone() })
            }
        }
    }
}

/// Drain a started schedule into offsets from `origin` (test helper)
#[cfg(test)]
pub(crate) fn drain_offsets(sched: &dyn Schedule, origin: Instant) -> Vec<Duration> {
    let mut out = Vec::new();
    while let Some(t) = sched.next() {
        out.push(t.duration_since(origin));
        assert!(out.len() < 1_000_000, "schedule does not terminate");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_parse_plan_list_yaml() {
        let yaml = r#"
- type: once
  times: 2
- type: const
  ops: 4
  duration: 0.5s
"#;
        let plan: SchedulePlan = serde_yaml::from_str(yaml).unwrap();
        let SchedulePlan::Many(steps) = &plan else {
            panic!("expected list");
        };
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0], ScheduleConfig::Once { times: 2 });
        assert_eq!(
            steps[1],
            ScheduleConfig::Const { ops: 4.0, duration: ms(500) }
        );
    }

    #[test]
    fn test_parse_single_and_aliases() {
        let plan: SchedulePlan =
            serde_yaml::from_str("{type: instances_step, from: 1, to: 3, step: 1, stepduration: 1s}").unwrap();
        assert!(matches!(
            plan,
            SchedulePlan::One(ScheduleConfig::InstanceStep { from: 1, to: 3, step: 1, .. })
        ));
    }

    #[test]
    fn test_once_then_const_emits_four_tokens() {
        let plan = SchedulePlan::Many(vec![
            ScheduleConfig::Once { times: 2 },
            ScheduleConfig::Const { ops: 4.0, duration: ms(500) },
        ]);
        let sched = plan.build().unwrap();
        let origin = Instant::now();
        sched.start(origin);
        assert_eq!(sched.left(), 4);
        let offsets = drain_offsets(sched.as_ref(), origin);
        assert_eq!(offsets, vec![ms(0), ms(0), ms(0), ms(250)]);
    }

    #[test]
    fn test_validation_failures() {
        let bad = [
            ScheduleConfig::Const { ops: -1.0, duration: ms(100) },
            ScheduleConfig::Const { ops: 10.0, duration: Duration::ZERO },
            ScheduleConfig::Line { from: 1.0, to: 2.0, duration: Duration::ZERO },
            ScheduleConfig::Step { from: 1.0, to: 5.0, step: 0.0, duration: ms(10) },
            ScheduleConfig::Unlimited { duration: Duration::ZERO },
            ScheduleConfig::Composite { steps: vec![] },
        ];
        for cfg in bad {
            assert!(cfg.build().is_err(), "{} should be rejected", cfg);
        }
    }

    #[test]
    fn test_step_ramp() {
        let cfg = ScheduleConfig::Step { from: 1.0, to: 3.0, step: 1.0, duration: Duration::from_secs(1) };
        let sched = cfg.build().unwrap();
        let origin = Instant::now();
        sched.start(origin);
        assert_eq!(sched.left(), 6);
        let offsets = drain_offsets(sched.as_ref(), origin);
        assert_eq!(offsets.len(), 6);
        assert_eq!(&offsets[..4], &[ms(0), ms(1000), ms(1500), ms(2000)]);
        assert!(offsets[4] > ms(2333) && offsets[4] < ms(2334));
        assert!(offsets[5] > ms(2666) && offsets[5] < ms(2667));
        assert_eq!(sched.finish(), Some(origin + Duration::from_secs(3)));
    }

    #[test]
    fn test_descending_step() {
        let cfg = ScheduleConfig::Step { from: 3.0, to: 1.0, step: 1.0, duration: Duration::from_secs(1) };
        let sched = cfg.build().unwrap();
        assert_eq!(sched.left(), 6);
    }

    #[test]
    fn test_instance_step_pauses_between_batches() {
        let cfg = ScheduleConfig::InstanceStep { from: 2, to: 6, step: 2, step_duration: ms(100) };
        let sched = cfg.build().unwrap();
        let origin = Instant::now();
        sched.start(origin);
        let offsets = drain_offsets(sched.as_ref(), origin);
        assert_eq!(offsets, vec![ms(0), ms(0), ms(100), ms(100), ms(200), ms(200)]);
    }

    #[test]
    fn test_instance_const_spreads_evenly() {
        let cfg = ScheduleConfig::InstanceConst { count: 4, duration: Duration::from_secs(2) };
        let sched = cfg.build().unwrap();
        let origin = Instant::now();
        sched.start(origin);
        let offsets = drain_offsets(sched.as_ref(), origin);
        assert_eq!(offsets, vec![ms(0), ms(500), ms(1000), ms(1500)]);
    }
}
