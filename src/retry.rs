//! Retry-delay schedules: pluggable functions from a completed attempt count
//! to the next moment the task becomes claimable again.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Computes the next attempt time from the number of completed attempts.
pub type NextAttemptFn = Arc<dyn Fn(i32) -> DateTime<Utc> + Send + Sync>;

/// Retry delays following the Fibonacci sequence, in minutes.
pub const FIBONACCI_PERIODS: [Duration; 10] = [
    Duration::from_secs(60),
    Duration::from_secs(2 * 60),
    Duration::from_secs(3 * 60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(8 * 60),
    Duration::from_secs(13 * 60),
    Duration::from_secs(21 * 60),
    Duration::from_secs(34 * 60),
    Duration::from_secs(55 * 60),
    Duration::from_secs(89 * 60),
];

/// A more aggressive schedule that levels off at one hour.
pub const STRONG_PERIODS: [Duration; 6] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(10 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(60 * 60),
];

fn delay_from_now(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
}

/// Fixed delay for every retry attempt.
pub fn static_delay(period: Duration) -> NextAttemptFn {
    Arc::new(move |_attempts| delay_from_now(period))
}

/// Walk the period table by attempt number, clamping to the last entry once
/// attempts run past the end.
///
/// With the strong schedule: attempt 0 waits 1m, attempt 1 waits 5m, …,
/// attempt 5 waits 1h, and every later attempt also waits 1h.
pub fn step_delay(periods: &'static [Duration]) -> NextAttemptFn {
    Arc::new(move |attempts| {
        let index = (attempts.max(0) as usize).min(periods.len() - 1);
        delay_from_now(periods[index])
    })
}

/// Walk the period table by attempt number modulo its length, so the
/// schedule wraps around instead of clamping.
///
/// With the strong schedule: attempt 5 waits 1h, attempt 6 waits 1m again.
pub fn round_step_delay(periods: &'static [Duration]) -> NextAttemptFn {
    Arc::new(move |attempts| {
        let index = (attempts.max(0) as usize) % periods.len();
        delay_from_now(periods[index])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delay_of(f: &NextAttemptFn, attempts: i32) -> Duration {
        let now = Utc::now();
        (f(attempts) - now).to_std().unwrap()
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(
            diff < Duration::from_secs(2),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    #[test]
    fn test_static_delay_ignores_attempts() {
        let f = static_delay(Duration::from_secs(600));
        assert_close(delay_of(&f, 0), Duration::from_secs(600));
        assert_close(delay_of(&f, 42), Duration::from_secs(600));
    }

    #[test]
    fn test_step_delay_clamps_to_last_period() {
        let f = step_delay(&STRONG_PERIODS);
        assert_close(delay_of(&f, 0), Duration::from_secs(60));
        assert_close(delay_of(&f, 3), Duration::from_secs(15 * 60));
        assert_close(delay_of(&f, 5), Duration::from_secs(60 * 60));
        assert_close(delay_of(&f, 9), Duration::from_secs(60 * 60));
    }

    #[test]
    fn test_round_step_delay_wraps_around() {
        let f = round_step_delay(&STRONG_PERIODS);
        assert_close(delay_of(&f, 5), Duration::from_secs(60 * 60));
        assert_close(delay_of(&f, 6), Duration::from_secs(60));
        assert_close(delay_of(&f, 8), Duration::from_secs(10 * 60));
    }

    #[test]
    fn test_fibonacci_periods_grow() {
        for window in FIBONACCI_PERIODS.windows(2) {
            assert!(window[0] < window[1]);
        }
    }
}
