//! Proxy limits and retry tuning.

use std::time::Duration;

use super::retry::RetryPolicy;

/// Immutable gateway configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyPolicy {
    /// Largest request body accepted, in bytes.
    pub max_request_size: usize,
    /// Bound on establishing an upstream connection, and on waiting for a
    /// free connection slot.
    pub connect_timeout: Duration,
    /// Bound on each read from the upstream.
    pub read_timeout: Duration,
    /// Budget for the whole request including retries.
    pub total_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    /// Concurrent upstream calls.
    pub max_connections: usize,
    /// Request bodies are forwarded in pieces of this size.
    pub chunk_size: usize,
    /// Extra request headers never forwarded (lowercase).
    pub filtered_headers: Vec<String>,
}

impl Default for ProxyPolicy {
    fn default() -> Self {
        Self {
            max_request_size: 1024 * 1024,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(60),
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_factor: 2.0,
            max_connections: 100,
            chunk_size: 64 * 1024,
            filtered_headers: Vec::new(),
        }
    }
}

impl ProxyPolicy {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            backoff_factor: self.backoff_factor,
            total_timeout: self.total_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = ProxyPolicy::default();
        assert_eq!(policy.max_request_size, 1_048_576);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.chunk_size, 65_536);
    }

    #[test]
    fn test_retry_policy_carries_backoff() {
        let policy = ProxyPolicy {
            initial_backoff: Duration::from_millis(7),
            ..ProxyPolicy::default()
        };
        let retry = policy.retry_policy();
        assert_eq!(retry.initial_backoff, Duration::from_millis(7));
        assert_eq!(retry.total_timeout, policy.total_timeout);
    }
}
