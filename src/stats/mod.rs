//! Runtime counters
//!
//! Lock-free per-pool counters updated from the hot path (instances, guns,
//! provider) and read by the expvar endpoint and the run summary.
//!
//! Every counter sits on its own cache line so that instances on different
//! cores never contend on the same line.
//!
//! # Example
//!
//! ```
//! use loadtool::stats::PoolStats;
//!
//! let stats = PoolStats::default();
//! stats.shots_fired.add(3);
//! stats.instances_alive.add(1);
//! stats.instances_alive.sub(1);
//!
//! let snap = stats.snapshot();
//! assert_eq!(snap.shots_fired, 3);
//! assert_eq!(snap.instances_alive, 0);
//! ```

pub mod expvar;

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Cache-line aligned atomic counter
///
/// 8 bytes of value plus 56 bytes of padding fill a 64-byte line.
#[derive(Debug)]
#[repr(align(64))]
pub struct AlignedCounter {
    value: AtomicU64,
    _padding: [u8; 56],
}

impl AlignedCounter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
            _padding: [0; 56],
        }
    }

    /// Relaxed ordering: counters are independent of each other
    #[inline]
    pub fn add(&self, val: u64) {
        self.value.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    /// Saturates at zero
    #[inline]
    pub fn sub(&self, val: u64) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(val)));
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for AlignedCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters of one instance pool
#[derive(Debug, Default)]
pub struct PoolStats {
    pub ammo_acquired: AlignedCounter,
    pub shots_fired: AlignedCounter,
    /// Ammo dropped because its rate token was already overdue
    pub shots_discarded: AlignedCounter,
    pub samples_reported: AlignedCounter,
    pub instances_alive: AlignedCounter,
    /// Instances ever started
    pub instances_started: AlignedCounter,
}

/// Point-in-time copy of [`PoolStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub ammo_acquired: u64,
    pub shots_fired: u64,
    pub shots_discarded: u64,
    pub samples_reported: u64,
    pub instances_alive: u64,
    pub instances_started: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            ammo_acquired: self.ammo_acquired.get(),
            shots_fired: self.shots_fired.get(),
            shots_discarded: self.shots_discarded.get(),
            samples_reported: self.samples_reported.get(),
            instances_alive: self.instances_alive.get(),
            instances_started: self.instances_started.get(),
        }
    }
}

/// Stats of every pool in the run, keyed by pool id
#[derive(Debug, Default, Clone)]
pub struct StatsRegistry {
    pools: Arc<Mutex<BTreeMap<String, Arc<PoolStats>>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `pool_id`, created on first use
    pub fn pool(&self, pool_id: &str) -> Arc<PoolStats> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(pools.entry(pool_id.to_string()).or_default())
    }

    pub fn snapshot(&self) -> BTreeMap<String, PoolSnapshot> {
        let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools
            .iter()
            .map(|(id, stats)| (id.clone(), stats.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_counter_size() {
        assert_eq!(std::mem::size_of::<AlignedCounter>(), 64);
        assert_eq!(std::mem::align_of::<AlignedCounter>(), 64);
    }

    #[test]
    fn test_sub_saturates() {
        let c = AlignedCounter::new();
        c.add(2);
        c.sub(5);
        assert_eq!(c.get(), 0);
    }

    #[test]
    fn test_counter_concurrent() {
        let c = Arc::new(AlignedCounter::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        c.inc();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.get(), 4000);
    }

    #[test]
    fn test_registry_shares_pool_counters() {
        let registry = StatsRegistry::new();
        registry.pool("a").shots_fired.add(2);
        registry.pool("a").shots_fired.add(1);
        registry.pool("b");
        let snap = registry.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["a"].shots_fired, 3);
        assert_eq!(snap["b"].shots_fired, 0);
    }
}
