// Retry strategies for outbound deliveries and scheduled calls
// Attempts are 1-based: `next_delay(n)` is the wait after attempt `n` failed.

use crate::models::{
    BackoffKind, RetryPolicy, SubscriptionRetryConfig, WebhookRetryConfig,
};
use rand::Rng;
use std::time::Duration;

/// Upper bound for any single webhook retry delay
pub const MAX_WEBHOOK_DELAY_MS: u64 = 60_000;

/// Default jitter added on top of webhook backoff (10%)
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Delay before the attempt following `attempt`, or None once attempts are exhausted
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Total number of attempts, including the first one
    fn max_attempts(&self) -> u32;

    /// Check if another attempt is allowed after `attempt`
    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }
}

/// Exponential backoff with jitter
/// Sequence: initial, initial * m, initial * m^2, ... capped at max_delay
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    multiplier: f64,
    max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    jitter_factor: f64,
    max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: MAX_WEBHOOK_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            max_attempts: 3,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new exponential backoff strategy with custom values
    pub fn with_config(
        initial_delay_ms: u64,
        multiplier: f64,
        max_delay_ms: u64,
        jitter_factor: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay_ms,
            multiplier: if multiplier.is_finite() && multiplier >= 1.0 {
                multiplier
            } else {
                1.0
            },
            max_delay_ms,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Exponential delay without jitter, in milliseconds
    fn calculate_base_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        if !delay.is_finite() || delay >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            delay as u64
        }
    }

    /// Add random jitter to prevent thundering herd
    fn add_jitter_ms(&self, base_delay_ms: u64) -> u64 {
        if self.jitter_factor == 0.0 {
            return base_delay_ms;
        }

        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };

        base_delay_ms + jitter_ms
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }

        let base_delay_ms = self.calculate_base_delay(attempt);
        let delay_ms = self.add_jitter_ms(base_delay_ms).min(self.max_delay_ms);

        Some(Duration::from_millis(delay_ms))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl From<&WebhookRetryConfig> for ExponentialBackoff {
    fn from(config: &WebhookRetryConfig) -> Self {
        ExponentialBackoff::with_config(
            config.initial_delay_ms,
            config.backoff_multiplier,
            MAX_WEBHOOK_DELAY_MS,
            DEFAULT_JITTER_FACTOR,
            config.max_attempts,
        )
    }
}

/// Fixed delay between attempts
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: max_attempts.max(1),
        }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        Some(self.delay)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Linear backoff: `step * attempt`
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    step: Duration,
    max_attempts: u32,
}

impl LinearBackoff {
    pub fn new(step: Duration, max_attempts: u32) -> Self {
        Self {
            step,
            max_attempts: max_attempts.max(1),
        }
    }
}

impl RetryStrategy for LinearBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        Some(self.step.saturating_mul(attempt))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl From<&SubscriptionRetryConfig> for LinearBackoff {
    fn from(config: &SubscriptionRetryConfig) -> Self {
        LinearBackoff::new(Duration::from_millis(config.backoff_ms), config.max_attempts)
    }
}

/// Build the strategy for a schedule's retry policy
///
/// Exponential schedule backoff doubles without jitter: `delay * 2^(attempt-1)`.
pub fn strategy_for_policy(policy: &RetryPolicy) -> Box<dyn RetryStrategy> {
    match policy.backoff.kind {
        BackoffKind::Fixed => Box::new(FixedDelay::new(
            Duration::from_millis(policy.backoff.delay_ms),
            policy.attempts,
        )),
        BackoffKind::Exponential => Box::new(ExponentialBackoff::with_config(
            policy.backoff.delay_ms,
            2.0,
            u64::MAX,
            0.0,
            policy.attempts,
        )),
    }
}
