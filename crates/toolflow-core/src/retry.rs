//! Retry Policy
//!
//! One retry counter is shared by every stage of a run. A flaky early stage
//! can therefore spend retries a later stage would have needed; raise
//! `max_retries` when that matters.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the same stage again.
    Retry,
    /// End the stage loop.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2 }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn decide(&self, retry_count: u32, retryable: bool) -> RetryDecision {
        if retryable && retry_count < self.max_retries {
            RetryDecision::Retry
        } else {
            RetryDecision::Stop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_within_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(0, true), RetryDecision::Retry);
        assert_eq!(policy.decide(1, true), RetryDecision::Retry);
        assert_eq!(policy.decide(2, true), RetryDecision::Stop);
    }

    #[test]
    fn test_non_retryable_always_stops() {
        let policy = RetryPolicy::new(5);
        assert_eq!(policy.decide(0, false), RetryDecision::Stop);
    }

    #[test]
    fn test_zero_retries() {
        assert_eq!(RetryPolicy::new(0).decide(0, true), RetryDecision::Stop);
    }
}
