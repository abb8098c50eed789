//! Time sources for counter backends and limiters.
//!
//! All timestamps are unix epoch seconds as `f64`, which is the resolution the
//! durable and shared backends store. Tests swap in [`MockClock`] to move time
//! forward without sleeping.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current unix time in seconds.
    fn now(&self) -> f64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default()
    }
}

/// Manually driven clock for tests.
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<RwLock<f64>>,
}

impl MockClock {
    /// Create a clock frozen at `start` (unix seconds).
    pub fn new(start: f64) -> Self {
        Self {
            current: Arc::new(RwLock::new(start)),
        }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: f64) {
        *self.current.write() += secs;
    }

    /// Jump to an absolute time.
    pub fn set(&self, now: f64) {
        *self.current.write() = now;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(1_700_000_000.0)
    }
}

impl Clock for MockClock {
    fn now(&self) -> f64 {
        *self.current.read()
    }
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// The default clock used by backends constructed without one.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Convert unix seconds into a UTC timestamp.
pub fn to_datetime(ts: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis((ts * 1000.0).round() as i64).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let t1 = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t2 = clock.now();
        assert!(t2 > t1);
    }

    #[test]
    fn test_mock_clock_advance_and_set() {
        let clock = MockClock::new(100.0);
        assert_eq!(clock.now(), 100.0);

        clock.advance(2.5);
        assert_eq!(clock.now(), 102.5);

        clock.set(10.0);
        assert_eq!(clock.now(), 10.0);
    }

    #[test]
    fn test_mock_clock_clones_share_time() {
        let clock = MockClock::new(0.0);
        let other = clock.clone();
        clock.advance(60.0);
        assert_eq!(other.now(), 60.0);
    }

    #[test]
    fn test_to_datetime() {
        let dt = to_datetime(1_700_000_000.5);
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_millis(), 500);
    }
}
