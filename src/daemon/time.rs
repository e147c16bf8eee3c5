//! Time sources for idle-timeout bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Provides the current time as nanoseconds on a monotonic scale. The scale's
/// origin is arbitrary; only differences are ever interpreted.
pub trait TimeSource: Send + Sync {
    fn now_nanos(&self) -> u64;
}

impl<T: TimeSource + ?Sized> TimeSource for std::sync::Arc<T> {
    fn now_nanos(&self) -> u64 {
        (**self).now_nanos()
    }
}

/// Default time source backed by `Instant`.
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl TimeSource for MonotonicClock {
    #[inline]
    fn now_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Manually driven time source for tests and simulations. Time only moves
/// when [`ManualClock::advance`] is called.
#[derive(Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> ManualClock {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    #[inline]
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}
