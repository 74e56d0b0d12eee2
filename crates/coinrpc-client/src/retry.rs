use coinrpc_common::protocol::error::{CoinrpcError, Result};
use std::time::Duration;

/// Configuration for batch retries with exponential backoff.
///
/// When a batch exchange fails with the transient overload error
/// ("Internal server error"), the dispatcher resends the whole batch with
/// fresh identifiers, waiting between attempts, up to `max_retries` times.
/// After that every call in the batch fails with
/// [`CoinrpcError::RetriesExhausted`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (excluding initial attempt)
    ///
    /// Total attempts = max_retries + 1
    /// Default: 3
    pub max_retries: usize,
    /// Initial backoff in milliseconds
    ///
    /// First retry waits this long, subsequent retries use exponential backoff.
    /// Default: 50ms
    pub initial_backoff_ms: u64,
    /// Maximum backoff in milliseconds
    ///
    /// Default: 5000ms (5 seconds)
    pub max_backoff_ms: u64,
    /// Exponential backoff multiplier
    ///
    /// Default: 2.0 (doubles each time)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Creates a validated retry configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoinrpcError::InvalidConfig`] if the multiplier is below 1.0
    /// (or not finite) or the initial backoff exceeds the maximum.
    pub fn new(
        max_retries: usize,
        initial_backoff_ms: u64,
        max_backoff_ms: u64,
        backoff_multiplier: f64,
    ) -> Result<Self> {
        let config = Self {
            max_retries,
            initial_backoff_ms,
            max_backoff_ms,
            backoff_multiplier,
        };
        config.validate()?;
        Ok(config)
    }

    /// Disables retrying entirely.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(CoinrpcError::InvalidConfig(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(CoinrpcError::InvalidConfig(format!(
                "initial backoff {}ms exceeds maximum {}ms",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }

    /// Backoff that follows `current_ms`, capped at `max_backoff_ms`.
    pub fn next_backoff_ms(&self, current_ms: u64) -> u64 {
        std::cmp::min(
            (current_ms as f64 * self.backoff_multiplier) as u64,
            self.max_backoff_ms,
        )
    }

    /// Wait before retry number `retry` (1-based).
    pub fn backoff(&self, retry: usize) -> Duration {
        let mut backoff_ms = self.initial_backoff_ms;
        for _ in 1..retry {
            backoff_ms = self.next_backoff_ms(backoff_ms);
        }
        Duration::from_millis(backoff_ms)
    }
}
