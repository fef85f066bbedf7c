//! Retry policy and exponential backoff
//!
//! Within one attempt sequence, the n-th failed attempt waits
//! `retry_timer * 2^(n-1)` before the next attempt. After `retry_count`
//! retries the sequence is complete, and the k-th completed sequence waits
//! `sequence_delay_timer * 2^(k-1)` before a fresh sequence starts. Every
//! delay is capped by the caller-supplied ceiling.

use serde::{Deserialize, Serialize};

/// Largest exponent applied to a base delay
pub const MAX_BACKOFF_EXPONENT: u32 = 31;

/// `base * 2^(attempt-1)`, saturating and capped at `ceiling`
///
/// `attempt` is 1-based; attempt 0 yields no delay.
pub fn backoff(base: u64, attempt: u32, ceiling: u64) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let exponent = (attempt - 1).min(MAX_BACKOFF_EXPONENT);
    base.saturating_mul(1u64 << exponent).min(ceiling)
}

/// Administrator-tunable retry policy of a server account
///
/// Defaults follow the Server object defaults of LwM2M 1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt within one sequence
    pub retry_count: u32,
    /// Base delay between attempts, in seconds
    pub retry_timer: u64,
    /// Additional sequences after the first one
    pub sequence_retry_count: u32,
    /// Base delay between sequences, in seconds
    pub sequence_delay_timer: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 5,
            retry_timer: 60,
            sequence_retry_count: 1,
            sequence_delay_timer: 86400,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        retry_count: u32,
        retry_timer: u64,
        sequence_retry_count: u32,
        sequence_delay_timer: u64,
    ) -> Self {
        Self {
            retry_count,
            retry_timer,
            sequence_retry_count,
            sequence_delay_timer,
        }
    }

    /// A policy that gives up after the first failure
    pub fn no_retry() -> Self {
        Self::new(0, 0, 0, 0)
    }
}

/// What to do after a failed exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry within the current sequence after the delay
    RetryAfter(u64),
    /// The sequence is complete; start the next one after the delay
    NextSequenceAfter(u64),
    /// Attempt and sequence budgets are both exhausted
    Exhausted,
}

/// Failure counters of the current attempt ladder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryCounters {
    /// Failed attempts in the current sequence
    pub failed_attempts: u32,
    /// Sequences completed without success
    pub completed_sequences: u32,
}

impl RetryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear both counters, e.g. after a successful exchange
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record a failed attempt and decide how to continue
    pub fn on_failure(&mut self, policy: &RetryPolicy, ceiling: u64) -> RetryDecision {
        self.failed_attempts += 1;
        if self.failed_attempts <= policy.retry_count {
            return RetryDecision::RetryAfter(backoff(
                policy.retry_timer,
                self.failed_attempts,
                ceiling,
            ));
        }

        self.failed_attempts = 0;
        self.completed_sequences += 1;
        if self.completed_sequences <= policy.sequence_retry_count {
            RetryDecision::NextSequenceAfter(backoff(
                policy.sequence_delay_timer,
                self.completed_sequences,
                ceiling,
            ))
        } else {
            RetryDecision::Exhausted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff() {
        assert_eq!(backoff(60, 0, u64::MAX), 0);
        assert_eq!(backoff(60, 1, u64::MAX), 60);
        assert_eq!(backoff(60, 2, u64::MAX), 120);
        assert_eq!(backoff(60, 3, u64::MAX), 240);
        assert_eq!(backoff(60, 3, 100), 100);
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(backoff(u64::MAX / 2, 40, u64::MAX), u64::MAX);
        assert_eq!(backoff(1, 200, 3600), 3600);
    }

    #[test]
    fn test_attempt_ladder() {
        let policy = RetryPolicy::new(3, 60, 1, 1000);
        let mut counters = RetryCounters::new();

        assert_eq!(counters.on_failure(&policy, u64::MAX), RetryDecision::RetryAfter(60));
        assert_eq!(counters.on_failure(&policy, u64::MAX), RetryDecision::RetryAfter(120));
        assert_eq!(counters.on_failure(&policy, u64::MAX), RetryDecision::RetryAfter(240));
        assert_eq!(
            counters.on_failure(&policy, u64::MAX),
            RetryDecision::NextSequenceAfter(1000)
        );

        for delay in [60, 120, 240] {
            assert_eq!(counters.on_failure(&policy, u64::MAX), RetryDecision::RetryAfter(delay));
        }
        assert_eq!(counters.on_failure(&policy, u64::MAX), RetryDecision::Exhausted);
    }

    #[test]
    fn test_sequence_backoff_grows() {
        let policy = RetryPolicy::new(0, 60, 3, 100);
        let mut counters = RetryCounters::new();

        assert_eq!(counters.on_failure(&policy, u64::MAX), RetryDecision::NextSequenceAfter(100));
        assert_eq!(counters.on_failure(&policy, u64::MAX), RetryDecision::NextSequenceAfter(200));
        assert_eq!(counters.on_failure(&policy, u64::MAX), RetryDecision::NextSequenceAfter(400));
        assert_eq!(counters.on_failure(&policy, u64::MAX), RetryDecision::Exhausted);
    }

    #[test]
    fn test_no_retry_policy() {
        let mut counters = RetryCounters::new();
        assert_eq!(
            counters.on_failure(&RetryPolicy::no_retry(), u64::MAX),
            RetryDecision::Exhausted
        );
    }
}
