//! Retry policy for HTTP GraphQL operations
//!
//! Status-code driven retries with exponential backoff and jitter. When the
//! server supplies a `Retry-After` header it takes precedence over the
//! computed backoff delay.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;

/// Retry policy for HTTP GraphQL operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Backoff multiplier (exponential backoff)
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0) to add randomness
    pub jitter_factor: f64,
    /// HTTP status codes that trigger a retry
    pub retry_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            retry_status_codes: vec![429, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern methods
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_retry_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.retry_status_codes = codes;
        self
    }

    /// Check if an HTTP status should trigger a retry
    pub fn should_retry(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }

    /// Calculate the backoff delay for a specific attempt number (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);
        let base_delay = Duration::from_millis(delay_ms as u64);
        self.apply_jitter(std::cmp::min(base_delay, self.max_delay))
    }

    /// Spread a delay uniformly across `[1 - jitter, 1 + jitter]` so
    /// simultaneous clients do not retry in lockstep
    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let spread = 1.0 + self.jitter_factor * (rand::random::<f64>() * 2.0 - 1.0);
        Duration::from_millis((delay.as_millis() as f64 * spread) as u64)
    }

    /// The delay to apply after a retryable response: the `Retry-After`
    /// header when present, otherwise the computed backoff
    pub fn delay_for(&self, attempt: u32, headers: &HeaderMap) -> Duration {
        if let Some(delay) = retry_after(headers) {
            return std::cmp::min(delay, self.max_delay);
        }
        self.calculate_delay(attempt)
    }
}

/// Parse a `Retry-After` header in its delay-seconds form
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let seconds: u64 = value.trim().parse().ok()?;
    Some(Duration::from_secs(seconds))
}
