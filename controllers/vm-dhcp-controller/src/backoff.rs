//! # Exponential Backoff
//!
//! Per-key retry delays for the reconcile queues and for optimistic
//! concurrency retries on status writes.
//!
//! Each failure doubles the delay starting at `base`, capped at `max`.
//! After `budget` consecutive failures the item is dropped until the next
//! change event.

use std::time::Duration;

/// Work-queue base delay
pub const QUEUE_BASE_DELAY: Duration = Duration::from_millis(5);

/// Work-queue maximum delay
pub const QUEUE_MAX_DELAY: Duration = Duration::from_secs(300);

/// Consecutive failures tolerated before an item is dropped
pub const RETRY_BUDGET: u32 = 5;

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    budget: u32,
    failures: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(QUEUE_BASE_DELAY, QUEUE_MAX_DELAY, RETRY_BUDGET)
    }
}

impl ExponentialBackoff {
    /// Create a backoff doubling from `base` up to `max`, giving up after
    /// `budget` failures.
    #[must_use]
    pub fn new(base: Duration, max: Duration, budget: u32) -> Self {
        Self {
            base,
            max,
            budget,
            failures: 0,
        }
    }

    /// Record a failure and return the delay before the next attempt, or
    /// `None` once the retry budget is spent.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.failures >= self.budget {
            return None;
        }
        let delay = Self::calculate_for_failures(self.failures, self.base, self.max);
        self.failures += 1;
        Some(delay)
    }

    /// Consecutive failures recorded so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Reset after a success
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Delay after `failures` previous failures: `base * 2^failures`, capped.
    #[must_use]
    pub fn calculate_for_failures(failures: u32, base: Duration, max: Duration) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        base.checked_mul(factor).map_or(max, |d| d.min(max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_sequence() {
        let mut backoff = ExponentialBackoff::default();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(5)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(40)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(80)));
        // budget of 5 spent
        assert_eq!(backoff.next_backoff(), None);
        assert_eq!(backoff.failures(), 5);
    }

    #[test]
    fn test_max_cap() {
        let max = Duration::from_secs(300);
        assert_eq!(
            ExponentialBackoff::calculate_for_failures(20, Duration::from_millis(5), max),
            max
        );
        assert_eq!(
            ExponentialBackoff::calculate_for_failures(40, Duration::from_millis(5), max),
            max
        );
    }

    #[test]
    fn test_reset() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_secs(1), 2);
        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_none());

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1)));
    }
}
