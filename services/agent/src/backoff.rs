//! Exponential retry delays for reconnects, stream recreation and registration.

use std::time::Duration;

/// Smallest delay a backoff will produce.
const MIN_FLOOR: Duration = Duration::from_millis(1);

/// Exponential backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay returned by the first `next()` and after every `reset()`.
    pub min: Duration,

    /// Upper bound for any delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Stateful exponential backoff.
///
/// Each call to [`Backoff::next`] returns the current delay and doubles it for
/// the following call, capped at `max`. The sequence is non-decreasing until
/// [`Backoff::reset`] is called. There is no jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    /// Create a backoff from a policy.
    ///
    /// `min` is clamped to at least one millisecond and `max` to at least `min`.
    pub fn new(policy: BackoffPolicy) -> Self {
        let min = policy.min.max(MIN_FLOOR);
        let max = policy.max.max(min);
        Self {
            current: min,
            min,
            max,
        }
    }

    /// Delay to wait before the next attempt. Advances the state.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Go back to the minimum delay.
    pub fn reset(&mut self) {
        self.current = self.min;
    }

    /// Delay the next call to `next()` would return.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl From<BackoffPolicy> for Backoff {
    fn from(policy: BackoffPolicy) -> Self {
        Self::new(policy)
    }
}
