//! Retry policy for the blob-write stage.
//!
//! A fixed attempt budget with a fixed delay table, clamped to the last
//! entry. Only transient blob-write failures consume the budget;
//! preparation failures and terminal remote errors short-circuit it.

use std::time::Duration;

use crate::config::Policy;

/// Fixed-budget retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    pub max_attempts: u32,

    /// Delay before each retry; attempts beyond the table reuse the
    /// last entry
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_policy(&Policy::default())
    }
}

impl RetryPolicy {
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            max_attempts: policy.max_upload_attempts,
            delays: policy.retry_delays.clone(),
        }
    }

    /// Check if we should retry based on attempt count (1-indexed)
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to sleep after a failed attempt (1-indexed), clamped to the
    /// last table entry
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.delays.is_empty() {
            return Duration::ZERO;
        }
        let index = (attempt.max(1) as usize - 1).min(self.delays.len() - 1);
        self.delays[index]
    }
}
