use std::time;

#[derive(Copy, Clone, Debug)]
/// The backoff used while waiting for the broker management endpoint to come up.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Calculate the time to sleep after a failed attempt. `attempt` starts at 0.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(attempt)
            .and_then(|factor| self.initial_interval.checked_mul(factor));

        match (candidate_interval, self.maximum_interval) {
            (Some(candidate), Some(max_interval)) => std::cmp::min(candidate, max_interval),
            (Some(candidate), None) => candidate,
            (None, Some(max_interval)) => max_interval,
            (None, None) => time::Duration::MAX,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: Some(time::Duration::from_secs(30)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_exponential() {
        let policy = RetryPolicy::new(2, time::Duration::from_secs(1), None);

        assert_eq!(policy.time_until_next_retry(0), time::Duration::from_secs(1));
        assert_eq!(policy.time_until_next_retry(1), time::Duration::from_secs(2));
        assert_eq!(policy.time_until_next_retry(3), time::Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.time_until_next_retry(4), time::Duration::from_secs(16));
        assert_eq!(policy.time_until_next_retry(5), time::Duration::from_secs(30));
        // Overflowing the multiplier falls back to the cap.
        assert_eq!(
            policy.time_until_next_retry(200),
            time::Duration::from_secs(30)
        );
    }
}
