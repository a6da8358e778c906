//! Monotonic time source and duration formatting

use std::time::{Duration, Instant};

/// Columns taken by a row timestamp: 8 digits of seconds, '.', 3 of millis.
///
/// Eight digits on the left-hand side cover a process running for about
/// three years before the column overflows.
pub const TIMESTAMP_WIDTH: usize = 8 + 1 + 3;

/// Source of monotonic readings.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// The process-wide monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Time from `earlier` to `later`, zero if the readings are out of order.
pub fn elapsed(earlier: Instant, later: Instant) -> Duration {
    later.saturating_duration_since(earlier)
}

/// Row timestamp, e.g. `       2.042`.
pub fn format_timestamp(duration: Duration) -> String {
    format!("{:8}.{:03}", duration.as_secs(), duration.subsec_millis())
}

/// Summary figure with microsecond precision, e.g. `     2.042117`.
pub fn format_precise(duration: Duration) -> String {
    format!("{:6}.{:06}", duration.as_secs(), duration.subsec_micros())
}

/// Clock that only moves when told to.
#[cfg(test)]
pub struct ManualClock {
    base: Instant,
    offset: std::cell::Cell<Duration>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: std::cell::Cell::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset.set(self.offset.get() + by);
    }
}

#[cfg(test)]
impl Clock for &ManualClock {
    fn now(&self) -> Instant {
        self.base + self.offset.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_format() {
        assert_eq!(format_timestamp(Duration::from_millis(2042)), "       2.042");
        assert_eq!(format_timestamp(Duration::from_micros(999)), "       0.000");
        assert_eq!(format_timestamp(Duration::from_secs(12_345_678)), "12345678.000");
        assert_eq!(format_timestamp(Duration::ZERO).len(), TIMESTAMP_WIDTH);
    }

    #[test]
    fn test_precise_format() {
        assert_eq!(format_precise(Duration::from_micros(2_042_117)), "     2.042117");
        assert_eq!(format_precise(Duration::from_nanos(1_999)), "     0.000001");
    }

    #[test]
    fn test_elapsed_saturates() {
        let clock = ManualClock::new();
        let early = (&clock).now();
        clock.advance(Duration::from_millis(5));
        let late = (&clock).now();

        assert_eq!(elapsed(early, late), Duration::from_millis(5));
        assert_eq!(elapsed(late, early), Duration::ZERO);
    }
}
