//! Bounded retry with exponential backoff for upstream calls.
//!
//! Only transport failures are retried; any HTTP response, whatever its
//! status, ends the loop.

use std::future::Future;
use std::time::{Duration, Instant};

use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    /// Hard budget measured from the start of the first attempt.
    pub total_timeout: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based):
    /// `initial_backoff * backoff_factor^attempt`, capped at `max_backoff`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.initial_backoff.as_nanos() as f64 * self.backoff_factor.powi(exponent);
        if !nanos.is_finite() || nanos >= self.max_backoff.as_nanos() as f64 {
            self.max_backoff
        } else {
            Duration::from_nanos(nanos.max(0.0) as u64)
        }
    }
}

/// Final result plus what it took to get there.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, GatewayError>,
    pub attempts: u32,
    pub delays: Vec<Duration>,
}

/// Run `operation` until it succeeds, retries are exhausted, or the total
/// budget is spent. `operation` receives the 0-based attempt number and
/// returns `Err(description)` for a retryable transport failure.
pub async fn run_with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let started = Instant::now();
    let mut delays = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        let remaining = policy.total_timeout.saturating_sub(started.elapsed());
        let result = match tokio::time::timeout(remaining, operation(attempt)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(attempt = attempt + 1, "Upstream attempt hit the total timeout");
                return RetryOutcome {
                    result: Err(GatewayError::UpstreamTimeout {
                        attempts: attempt + 1,
                        elapsed: started.elapsed(),
                        last_error: "total timeout exceeded".to_string(),
                    }),
                    attempts: attempt + 1,
                    delays,
                };
            }
        };

        let error = match result {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempts = attempt + 1, "Upstream succeeded after retry");
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    delays,
                };
            }
            Err(e) => e,
        };

        tracing::debug!(attempt = attempt + 1, error = %error, "Upstream attempt failed");

        if attempt >= policy.max_retries {
            tracing::warn!(attempts = attempt + 1, error = %error, "Upstream retries exhausted");
            return RetryOutcome {
                result: Err(GatewayError::UpstreamUnreachable {
                    attempts: attempt + 1,
                    last_error: error,
                }),
                attempts: attempt + 1,
                delays,
            };
        }

        let delay = policy.delay_for(attempt);
        if started.elapsed() + delay > policy.total_timeout {
            tracing::warn!(attempts = attempt + 1, error = %error, "Upstream retry budget spent");
            return RetryOutcome {
                result: Err(GatewayError::UpstreamTimeout {
                    attempts: attempt + 1,
                    elapsed: started.elapsed(),
                    last_error: error,
                }),
                attempts: attempt + 1,
                delays,
            };
        }

        delays.push(delay);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(1000),
            backoff_factor: 2.0,
            total_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_exponential_backoff_calculation() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(10));
        assert_eq!(p.delay_for(1), Duration::from_millis(20));
        assert_eq!(p.delay_for(2), Duration::from_millis(40));
    }

    #[test]
    fn test_max_backoff_cap() {
        let p = RetryPolicy {
            max_backoff: Duration::from_millis(25),
            ..policy()
        };
        assert_eq!(p.delay_for(2), Duration::from_millis(25));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_successful_first_attempt() {
        let outcome = run_with_retry(&policy(), |_| async { Ok::<_, String>(7) }).await;
        assert_eq!(outcome.result.unwrap(), 7);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.delays.is_empty());
    }

    #[tokio::test]
    async fn test_three_failures_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = run_with_retry(&policy(), |_| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err("connection refused".to_string())
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(outcome.result.unwrap(), "ok");
        assert_eq!(outcome.attempts, 4);
        assert_eq!(
            outcome.delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );
    }

    #[tokio::test]
    async fn test_all_retries_exhausted() {
        let outcome =
            run_with_retry(&policy(), |_| async { Err::<(), _>("reset".to_string()) }).await;
        assert_eq!(outcome.attempts, 4);
        match outcome.result {
            Err(GatewayError::UpstreamUnreachable { attempts, last_error }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last_error, "reset");
            }
            other => panic!("expected UpstreamUnreachable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_retries() {
        let p = RetryPolicy {
            max_retries: 0,
            ..policy()
        };
        let outcome = run_with_retry(&p, |_| async { Err::<(), _>("down".to_string()) }).await;
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.delays.is_empty());
    }

    #[tokio::test]
    async fn test_total_timeout_stops_retrying() {
        let p = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(40),
            max_backoff: Duration::from_millis(40),
            total_timeout: Duration::from_millis(100),
            ..policy()
        };
        let outcome = run_with_retry(&p, |_| async { Err::<(), _>("refused".to_string()) }).await;
        match outcome.result {
            Err(GatewayError::UpstreamTimeout { last_error, .. }) => assert_eq!(last_error, "refused"),
            other => panic!("expected UpstreamTimeout, got {:?}", other),
        }
        assert!(outcome.attempts < 11);
    }

    #[tokio::test]
    async fn test_slow_attempt_is_cut_at_total_timeout() {
        let p = RetryPolicy {
            total_timeout: Duration::from_millis(50),
            ..policy()
        };
        let started = Instant::now();
        let outcome = run_with_retry(&p, |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>(())
        })
        .await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(outcome.result, Err(GatewayError::UpstreamTimeout { .. })));
    }
}
