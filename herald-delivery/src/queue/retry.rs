//! Backoff arithmetic shared by the engine retry loop and the queue's
//! safety-net requeue.

use std::time::Duration;

/// Exponential backoff for the engine's in-attempt retry loop.
///
/// `delay(n) = min(base · multiplier^(n−1), max)` for 1-indexed attempt
/// `n`, saturating on overflow. The resulting schedule is non-decreasing
/// and bounded by `max`.
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, multiplier: u32, max: Duration) -> Duration {
    let mut delay = base;
    for _ in 1..attempt {
        delay = delay.saturating_mul(multiplier).min(max);
    }
    delay.min(max)
}

/// Linear requeue delay for queue-level retries:
/// `base · attempts`, with at least one base interval.
#[must_use]
pub fn requeue_delay(attempts: u32, base: Duration) -> Duration {
    base.saturating_mul(attempts.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(1_000);
        let max = Duration::from_millis(30_000);

        assert_eq!(backoff_delay(1, base, 2, max), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(2, base, 2, max), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(3, base, 2, max), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(6, base, 2, max), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(40, base, 2, max), max);
    }

    #[test]
    fn test_backoff_schedule_is_non_decreasing() {
        let base = Duration::from_millis(500);
        let max = Duration::from_millis(10_000);

        let mut previous = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = backoff_delay(attempt, base, 3, max);
            assert!(delay >= previous);
            assert!(delay <= max);
            previous = delay;
        }
    }

    #[test]
    fn test_backoff_with_multiplier_one_is_flat() {
        let base = Duration::from_millis(700);
        let max = Duration::from_millis(30_000);
        for attempt in 1..=5 {
            assert_eq!(backoff_delay(attempt, base, 1, max), base);
        }
    }

    #[test]
    fn test_requeue_delay_scales_linearly() {
        let base = Duration::from_millis(5_000);
        assert_eq!(requeue_delay(0, base), Duration::from_millis(5_000));
        assert_eq!(requeue_delay(1, base), Duration::from_millis(5_000));
        assert_eq!(requeue_delay(2, base), Duration::from_millis(10_000));
        assert_eq!(requeue_delay(3, base), Duration::from_millis(15_000));
    }
}
