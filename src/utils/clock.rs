//! Injectable wall-clock time source.
//!
//! Every timestamp persisted by the manager flows through [`Clock`] so tests
//! can install a fixed clock and assert exact nanosecond values.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;

/// Nanosecond-resolution wall-time source
pub trait Clock: Send + Sync {
    /// Current time in nanoseconds since the Unix epoch
    fn now_ns(&self) -> u64;
}

/// Production clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        // timestamp_nanos_opt only fails past the year 2262
        Utc::now()
            .timestamp_nanos_opt()
            .map_or(0, |ns| ns.max(0) as u64)
    }
}

/// Settable clock for tests
///
/// Starts at the given instant and only moves when told to.
#[derive(Debug, Default)]
pub struct FixedClock {
    now_ns: AtomicU64,
}

impl FixedClock {
    #[must_use]
    pub fn new(now_ns: u64) -> Arc<Self> {
        Arc::new(Self {
            now_ns: AtomicU64::new(now_ns),
        })
    }

    pub fn set(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ns: u64) {
        self.now_ns.fetch_add(delta_ns, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }
}
