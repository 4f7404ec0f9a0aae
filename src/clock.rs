// clock.rs
//
// Monotonic nanosecond source. Used for poll cadence, heartbeat timeout,
// and response-time statistics. Backed by `std::time::Instant`, which is
// already monotonic on every platform we target; the trait exists so the
// arbiter's priority/sleep logic can be driven by a fake clock in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub trait MonotonicClock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Real monotonic clock, anchored at construction time.
#[derive(Clone)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// Deterministic clock for tests: advances only when told to.
#[derive(Default)]
pub struct FakeClock {
    ns: AtomicU64,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            ns: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, delta_ns: u64) {
        self.ns.fetch_add(delta_ns, Ordering::SeqCst);
    }

    pub fn set(&self, ns: u64) {
        self.ns.store(ns, Ordering::SeqCst);
    }
}

impl MonotonicClock for FakeClock {
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances() {
        let clock = FakeClock::new();
        assert_eq!(clock.now_ns(), 0);
        clock.advance(500);
        assert_eq!(clock.now_ns(), 500);
        clock.set(10);
        assert_eq!(clock.now_ns(), 10);
    }
}
