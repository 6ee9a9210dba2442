//! Time units, clocks and float-tolerant time comparison.
//!
//! Buckets are accounted entirely in seconds: a token count becomes the
//! number of seconds the bucket needs to accrue it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;

/// Relative tolerance used when comparing two time values.
///
/// Wall clock readings carry about four significant decimal places, so
/// values closer than this are treated as the same instant.
pub const TIME_EPSILON: f64 = 0.0001;

/// Time unit in which a refill rate is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Millisecond => Duration::from_millis(1),
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
            TimeUnit::Week => Duration::from_secs(604800),
        }
    }

    /// Convert a "tokens per unit" rate into tokens per second.
    pub fn per_second(&self, tokens: f64) -> f64 {
        tokens / self.duration().as_secs_f64()
    }
}

impl Default for TimeUnit {
    fn default() -> Self {
        TimeUnit::Second
    }
}

/// Compare two time values, treating them as equal when their relative
/// difference is below [`TIME_EPSILON`].
pub fn compare_times(a: f64, b: f64) -> Ordering {
    let equal = if b == 0.0 {
        a == 0.0 || (a - b).abs() < TIME_EPSILON
    } else {
        ((a - b) / b).abs() < TIME_EPSILON
    };

    if equal {
        Ordering::Equal
    } else if a > b {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

/// Source of "now" for bucket accounting, in fractional seconds since the
/// Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Create a clock frozen at `now` seconds.
    pub fn new(now: f64) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by.as_secs_f64();
    }

    /// Jump to an absolute time.
    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Millisecond.duration(), Duration::from_millis(1));
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
        assert_eq!(TimeUnit::Week.duration(), Duration::from_secs(604800));
    }

    #[test]
    fn test_per_second_conversion() {
        assert_eq!(TimeUnit::Second.per_second(5.0), 5.0);
        assert_eq!(TimeUnit::Minute.per_second(120.0), 2.0);
        assert_eq!(TimeUnit::Millisecond.per_second(1.0), 1000.0);
    }

    #[test]
    fn test_compare_times_within_tolerance() {
        assert_eq!(compare_times(2.0, 2.0), Ordering::Equal);
        assert_eq!(compare_times(2.0001, 2.0), Ordering::Equal);
        assert_eq!(compare_times(1.9999, 2.0), Ordering::Equal);
    }

    #[test]
    fn test_compare_times_outside_tolerance() {
        assert_eq!(compare_times(2.01, 2.0), Ordering::Greater);
        assert_eq!(compare_times(1.99, 2.0), Ordering::Less);
    }

    #[test]
    fn test_compare_times_against_zero() {
        assert_eq!(compare_times(0.0, 0.0), Ordering::Equal);
        assert_eq!(compare_times(0.00005, 0.0), Ordering::Equal);
        assert_eq!(compare_times(0.5, 0.0), Ordering::Greater);
        assert_eq!(compare_times(-0.5, 0.0), Ordering::Less);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(100.0);
        assert_eq!(clock.now(), 100.0);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), 101.5);

        clock.set(10.0);
        assert_eq!(clock.now(), 10.0);
    }

    #[test]
    fn test_system_clock_is_epoch_seconds() {
        let now = SystemClock.now();
        // Sometime after 2020-01-01.
        assert!(now > 1_577_836_800.0);
    }
}
