//! Retry policies and per-(error, action) attempt bookkeeping.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::config::BackoffStrategy;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// How many times a recovery action may run for one error, and how long to
/// wait after each failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(default)]
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, strategy: BackoffStrategy, base_delay_ms: u64) -> Self {
        RetryPolicy {
            max_retries,
            strategy,
            base_delay_ms,
        }
    }

    pub fn fixed(max_retries: u32, delay_ms: u64) -> Self {
        RetryPolicy::new(max_retries, BackoffStrategy::Fixed, delay_ms)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }

    /// Delay after the failure numbered `attempt` (0 = first failure).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(attempt as u64 + 1),
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(attempt)),
        }
    }
}

impl Default for RetryPolicy {
    /// 3 attempts, 30 s apart.
    fn default() -> Self {
        RetryPolicy::fixed(3, 30_000)
    }
}

// ---------------------------------------------------------------------------
// AttemptTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct AttemptState {
    failures: u32,
    next_attempt_ms: u64,
}

/// Failure counts and backoff deadlines, keyed by `(error id, action name)`.
#[derive(Debug, Clone, Default)]
pub struct AttemptTracker {
    states: HashMap<(String, String), AttemptState>,
}

impl AttemptTracker {
    pub fn new() -> Self {
        AttemptTracker::default()
    }

    fn key(error_id: &str, action: &str) -> (String, String) {
        (error_id.to_string(), action.to_string())
    }

    pub fn failures(&self, error_id: &str, action: &str) -> u32 {
        self.states
            .get(&Self::key(error_id, action))
            .map(|s| s.failures)
            .unwrap_or(0)
    }

    /// Whether the budget allows another attempt.
    pub fn has_budget(&self, error_id: &str, action: &str, policy: &RetryPolicy) -> bool {
        policy.should_retry(self.failures(error_id, action))
    }

    /// Whether an attempt may run at `now_ms`: budget left and backoff over.
    pub fn is_ready(&self, error_id: &str, action: &str, policy: &RetryPolicy, now_ms: u64) -> bool {
        match self.states.get(&Self::key(error_id, action)) {
            None => policy.max_retries > 0,
            Some(s) => policy.should_retry(s.failures) && now_ms >= s.next_attempt_ms,
        }
    }

    /// Record a failed attempt; the next one waits the policy delay.
    pub fn record_failure(&mut self, error_id: &str, action: &str, policy: &RetryPolicy, now_ms: u64) -> u32 {
        let state = self.states.entry(Self::key(error_id, action)).or_default();
        state.failures += 1;
        state.next_attempt_ms = now_ms.saturating_add(policy.delay_ms(state.failures - 1));
        state.failures
    }

    /// Drop all state for one error.
    pub fn forget(&mut self, error_id: &str) {
        self.states.retain(|(id, _), _| id != error_id);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
