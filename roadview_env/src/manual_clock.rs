//! Deterministic clock for tests and replays.

use crate::Clock;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Virtual clock that only moves when told to.
///
/// Clones share the same underlying time, so a test can hand one clone to a
/// tracking engine and keep another to advance time between frames.
#[derive(Debug, Default)]
pub struct ManualClock {
    /// Current virtual time (nanoseconds since clock creation)
    time_ns: Arc<Mutex<u64>>,
}

impl ManualClock {
    /// Creates a clock at virtual time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped clock for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Advances virtual time by the given duration.
    pub fn advance(&self, duration: Duration) {
        let mut time = self.time_ns.lock().unwrap_or_else(|e| e.into_inner());
        *time = time.saturating_add(duration.as_nanos() as u64);
    }

    /// Sets the virtual time to a specific value.
    pub fn set(&self, time: Duration) {
        let mut guard = self.time_ns.lock().unwrap_or_else(|e| e.into_inner());
        *guard = time.as_nanos() as u64;
    }
}

impl Clone for ManualClock {
    fn clone(&self) -> Self {
        Self {
            time_ns: Arc::clone(&self.time_ns),
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(*self.time_ns.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_time() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);

        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_secs(1));

        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now(), Duration::from_millis(1500));
    }

    #[test]
    fn test_manual_clock_set() {
        let clock = ManualClock::new();
        clock.set(Duration::from_secs(10));
        assert_eq!(clock.now(), Duration::from_secs(10));
        assert!((clock.now_secs() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_manual_clock_clone_shares_time() {
        let c1 = ManualClock::new();
        let c2 = c1.clone();

        c1.advance(Duration::from_secs(5));

        assert_eq!(c1.now(), c2.now());
    }
}
