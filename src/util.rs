//! Time utilities.
//!
//! All wire timestamps in the protocol are signed 64-bit microsecond counts
//! on a monotonic clock. The clock source is injectable so protocol state
//! machines and the Kalman filter can be tested with pinned time.

use std::{
    fmt,
    sync::{Arc, OnceLock},
    time::Instant,
};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Microseconds elapsed on the process-wide monotonic clock.
///
/// The epoch is the first call in the process; only differences and
/// projections of this value are ever exchanged, never absolute values.
#[must_use]
pub fn now_us() -> i64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    i64::try_from(epoch.elapsed().as_micros()).unwrap_or(i64::MAX)
}

/// An injectable monotonic-microseconds source.
///
/// Defaults to [`now_us`]. Tests substitute a closure over shared state to
/// pin or step time deterministically.
#[derive(Clone)]
pub struct Clock {
    source: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl Clock {
    /// The process-wide monotonic clock.
    #[must_use]
    pub fn monotonic() -> Self {
        Self {
            source: Arc::new(now_us),
        }
    }

    /// A clock backed by an arbitrary closure.
    pub fn from_fn<F>(source: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        Self {
            source: Arc::new(source),
        }
    }

    /// Current time in microseconds.
    #[must_use]
    pub fn now_us(&self) -> i64 {
        (self.source)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::monotonic()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::*;

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
    }

    #[test]
    fn injected_clock_is_observed() {
        let ticks = Arc::new(AtomicI64::new(41));
        let clock = {
            let ticks = Arc::clone(&ticks);
            Clock::from_fn(move || ticks.load(Ordering::SeqCst))
        };
        assert_eq!(clock.now_us(), 41);
        ticks.store(42, Ordering::SeqCst);
        assert_eq!(clock.now_us(), 42);
    }
}
