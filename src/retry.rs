use std::time::Duration;

/// Retry policy for waiting on a busy lease.
///
/// Both bounds are optional; with neither set the wait is unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
    pub max_wait: Option<Duration>,
}

impl RetryPolicy {
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            max_wait: None,
        }
    }

    /// Delay before the next attempt, if any.
    /// - `failures_so_far`: attempts that have already failed (1 after the first)
    /// - `elapsed`: time spent waiting since the first attempt
    ///
    /// Returns `None` when another attempt would exceed either bound.
    pub fn next_delay(&self, failures_so_far: u32, elapsed: Duration) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if failures_so_far >= max {
                return None;
            }
        }
        if let Some(max_wait) = self.max_wait {
            if elapsed.saturating_add(self.interval) > max_wait {
                return None;
            }
        }
        Some(self.interval)
    }
}
