use std::time::Duration;

use kmirror_core::BackoffPolicy;

/// Exponential backoff state: `base * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self { Self { policy, attempt: 0 } }

    /// Delay before the next retry, or `None` once `max_retries` consecutive failures were seen.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.policy.max_retries > 0 && self.attempt as usize >= self.policy.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        let delay = self.policy.base_delay().saturating_mul(factor).min(self.policy.max_delay());
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    pub fn attempts(&self) -> u32 { self.attempt }

    pub fn reset(&mut self) { self.attempt = 0; }
}
