//! Shooting loop of a single worker
//!
//! ```text
//! loop {
//!     ammo  = provider.acquire()   else Exhausted
//!     token = rate.next()          else release(ammo), RateDone
//!     sleep until token (or cancel)
//!     gun.shoot(ammo)              panic -> error sample + fatal
//!     provider.release(ammo)
//! }
//! ```

use crate::aggregator::Reporter;
use crate::error::PoolError;
use crate::gun::Gun;
use crate::provider::Provider;
use crate::sample::{Sample, SampleError};
use crate::schedule::Schedule;
use crate::stats::PoolStats;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Lateness after which a token counts as overflowed when discarding is on
pub const OVERFLOW_TOLERANCE: Duration = Duration::from_millis(10);

/// Why an instance stopped without failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceExit {
    /// Provider has no more ammo
    Exhausted,
    /// Rate schedule is over
    RateDone,
    Cancelled,
}

pub struct Instance {
    pub id: usize,
    pub provider: Arc<Provider>,
    pub rate: Arc<dyn Schedule>,
    pub gun: Box<dyn Gun>,
    pub reporter: Reporter,
    pub stats: Arc<PoolStats>,
    pub cancel: CancellationToken,
    pub discard_overflow: bool,
}

/// Keeps `instances_alive` honest however the loop exits
struct AliveGuard(Arc<PoolStats>);

impl AliveGuard {
    fn new(stats: &Arc<PoolStats>) -> Self {
        stats.instances_alive.inc();
        stats.instances_started.inc();
        Self(Arc::clone(stats))
    }
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.instances_alive.sub(1);
    }
}

impl Instance {
    pub async fn run(mut self) -> Result<InstanceExit, PoolError> {
        let _alive = AliveGuard::new(&self.stats);
        let mut shots = 0u64;

        let exit = loop {
            let ammo = tokio::select! {
                _ = self.cancel.cancelled() => break InstanceExit::Cancelled,
                ammo = self.provider.acquire() => ammo,
            };
            let Some(ammo) = ammo else {
                break InstanceExit::Exhausted;
            };
            self.stats.ammo_acquired.inc();

            let Some(at) = self.rate.next() else {
                self.provider.release(ammo);
                break InstanceExit::RateDone;
            };

            if self.discard_overflow && Instant::now() > at + OVERFLOW_TOLERANCE {
                trace!(ammo_id = ammo.id, "Rate token overdue, ammo discarded");
                self.stats.shots_discarded.inc();
                self.provider.release(ammo);
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.provider.release(ammo);
                    break InstanceExit::Cancelled;
                }
                _ = tokio::time::sleep_until(at) => {}
            }

            self.stats.shots_fired.inc();
            shots += 1;
            let shot = AssertUnwindSafe(self.gun.shoot(&ammo)).catch_unwind().await;
            if let Err(panic) = shot {
                let reason = panic_message(panic.as_ref());
                error!(ammo_id = ammo.id, %reason, "Gun panicked");
                let mut sample = Sample::start(ammo.tag.clone());
                sample.set_error(SampleError::Panic(reason.clone()));
                sample.finish();
                self.reporter.report(sample).await;
                self.provider.release(ammo);
                return Err(PoolError::FatalInstance {
                    instance_id: self.id,
                    reason: format!("gun panicked: {}", reason),
                });
            }
            self.provider.release(ammo);
        };

        debug!(shots, ?exit, "Instance finished");
        Ok(exit)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
