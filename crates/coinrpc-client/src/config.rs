use std::time::Duration;

use coinrpc_common::protocol::error::{CoinrpcError, Result};

use crate::retry::RetryConfig;

/// Method that is always dispatched in a batch of its own by default.
pub const DEFAULT_ISOLATED_METHOD: &str = "getblock";

/// Client configuration.
///
/// Fixed when the client is built and immutable afterwards.
///
/// # Default Configuration
///
/// - `concurrency`: 1 batch in flight
/// - `batch_size`: 64 calls per batch
/// - `isolated_methods`: `["getblock"]`
/// - `request_timeout`: 30 seconds per exchange
/// - `retry`: [`RetryConfig::default`]
///
/// # Example
///
/// ```rust
/// use coinrpc_client::ClientConfig;
///
/// let config = ClientConfig::default()
///     .with_concurrency(4)
///     .with_batch_size(32);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum number of batches dispatched at the same time
    pub concurrency: usize,
    /// Maximum number of calls in one batch
    pub batch_size: usize,
    /// Methods that never share a batch with any other call
    pub isolated_methods: Vec<String>,
    /// Timeout for a single wire exchange
    pub request_timeout: Duration,
    /// Retry policy for the transient overload error
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            batch_size: 64,
            isolated_methods: vec![DEFAULT_ISOLATED_METHOD.to_string()],
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_isolated_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.isolated_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Checks the invariants the scheduler relies on.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(CoinrpcError::InvalidConfig("concurrency must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(CoinrpcError::InvalidConfig("batch size must be at least 1".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(CoinrpcError::InvalidConfig("request timeout must be non-zero".into()));
        }
        self.retry.validate()
    }

    pub fn is_isolated(&self, method: &str) -> bool {
        self.isolated_methods.iter().any(|m| m == method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.batch_size, 64);
        assert!(config.is_isolated("getblock"));
        assert!(!config.is_isolated("getblockhash"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::default()
            .with_concurrency(3)
            .with_batch_size(10)
            .with_isolated_methods(["getblock", "getrawmempool"])
            .with_request_timeout(Duration::from_secs(5))
            .with_retry(RetryConfig::none());
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.batch_size, 10);
        assert!(config.is_isolated("getrawmempool"));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.retry.max_retries, 0);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        assert!(ClientConfig::default().with_concurrency(0).validate().is_err());
        assert!(ClientConfig::default().with_batch_size(0).validate().is_err());
        assert!(ClientConfig::default()
            .with_request_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}
