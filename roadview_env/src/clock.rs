//! Monotonic clock abstraction.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of monotonic time for the tracking engine.
///
/// # Implementations
///
/// - **Production**: `SystemClock` - wraps `Instant`
/// - **Tests**: `ManualClock` - virtual time advanced explicitly
///
/// Only differences between two readings are meaningful; the origin is the
/// moment the clock was created.
pub trait Clock: Send + Sync + 'static {
    /// Returns the monotonic time elapsed since the clock was created.
    fn now(&self) -> Duration;

    /// Convenience: `now()` in fractional seconds.
    fn now_secs(&self) -> f64 {
        self.now().as_secs_f64()
    }
}

/// Production clock backed by `std::time::Instant`.
pub struct SystemClock {
    /// Origin for monotonic duration calculations
    start: Instant,
}

impl SystemClock {
    /// Creates a new SystemClock starting at zero.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped clock for sharing across components.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        let t2 = clock.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(5));
    }

    #[test]
    fn test_now_secs_matches_now() {
        let clock = SystemClock::new();
        let secs = clock.now_secs();
        assert!(secs >= 0.0);
        assert!(secs < 1.0);
    }
}
