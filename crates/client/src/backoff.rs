//! Reconnect delay policy.

use std::time::Duration;

use studio_protocol::error_codes;

/// Exponential growth from `initial` by `factor`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(800),
            factor: 1.7,
            max: Duration::from_secs(15),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based): `min(initial × factor^(attempt-1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = initial_ms * self.factor.max(1.0).powi(exponent);
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_millis(capped.max(initial_ms.min(max_ms)).round() as u64)
    }
}

/// Stateful backoff for one reconnect sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay for the next attempt; grows on every call until [`Backoff::reset`].
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.policy.delay_for_attempt(self.attempt)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Back to the floor after a successful handshake.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Delay before automatically retrying a failed connect, or `None` when the
/// failure code means retrying cannot help.
pub fn auto_retry_delay(
    code: Option<&str>,
    attempt: u32,
    policy: &BackoffPolicy,
) -> Option<Duration> {
    if code.is_some_and(error_codes::is_non_retryable_connect) {
        return None;
    }
    Some(policy.delay_for_attempt(attempt))
}
