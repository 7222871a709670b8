use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of "now" for everything time dependent. Swapping the wall clock for a
/// [`SimClock`] is what turns the live system into a back-test.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch (UTC).
    fn now(&self) -> i64;

    fn is_simulated(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A replayable clock driven explicitly by the simulation loop.
#[derive(Debug, Default)]
pub struct SimClock {
    now: AtomicI64,
}

impl SimClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Moves the clock forward and returns the new time.
    pub fn advance(&self, delta_ms: i64) -> i64 {
        self.now.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms
    }
}

impl Clock for SimClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn is_simulated(&self) -> bool {
        true
    }
}
