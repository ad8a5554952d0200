use std::time::Duration;

use rand::Rng;

/// Exponential backoff policy for transient failures.
///
/// - `max_attempts`: total tries before the caller gives up
/// - `initial_interval`: backoff before the first retry
/// - `maximum_interval`: cap for the computed backoff
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub maximum_interval: Duration,
}

impl RetryPolicy {
    pub const fn new(
        max_attempts: u32,
        initial_interval: Duration,
        maximum_interval: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_interval,
            maximum_interval,
        }
    }

    /// Backoff before retry number `attempt` (1-based), capped at the
    /// maximum interval.
    ///
    /// attempt = 1 => initial_interval
    /// attempt = n => initial_interval * 2^(n-1)
    pub fn interval(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let candidate = self
            .initial_interval
            .saturating_mul(2u32.saturating_pow(exp));
        candidate.min(self.maximum_interval)
    }

    /// Same as [`interval`](Self::interval) with full jitter, so a batch of
    /// workers retrying the same dependency does not reconnect in lockstep.
    pub fn jittered_interval(&self, attempt: u32) -> Duration {
        let max = self.interval(attempt);
        if max.is_zero() {
            return max;
        }
        let micros = rand::thread_rng().gen_range(0..=max.as_micros() as u64);
        Duration::from_micros(micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progression_and_cap() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(30),
        );

        // attempt -> expected seconds (capped at 30)
        let cases = vec![(1, 1), (2, 2), (3, 4), (4, 8), (5, 16), (6, 30), (10, 30)];
        for (attempt, expected_secs) in cases {
            assert_eq!(
                policy.interval(attempt),
                Duration::from_secs(expected_secs),
                "attempt {}",
                attempt
            );
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.interval(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_below_cap() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(5));
        for attempt in 1..10 {
            let jittered = policy.jittered_interval(attempt);
            assert!(jittered <= policy.interval(attempt));
        }
    }
}
