use std::future::Future;

use crate::{config::RetryPolicy, error::GatewayError};

/// Runs `call` until it succeeds or the policy's retries are exhausted.
///
/// Each attempt is bounded by `policy.call_timeout`; an expired attempt is
/// treated like a transport failure. The last error is returned once the
/// budget is spent.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut retry = 0;

    loop {
        let outcome = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(GatewayError::Timeout(policy.call_timeout)),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(error) if retry < policy.max_retries => {
                retry += 1;
                let delay = policy.backoff(retry);
                tracing::warn!(
                    operation,
                    error = %error,
                    retry,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Provider call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                tracing::error!(
                    operation,
                    error = %error,
                    attempts = retry + 1,
                    "Provider call failed, retries exhausted"
                );
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            call_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result = with_retry(&policy(3), "test", || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(GatewayError::Provider("connection reset".into()))
            } else {
                Ok("draft")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "draft");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result: Result<(), _> = with_retry(&policy(2), "test", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::SchemaValidation("missing title".into()))
        })
        .await;

        assert!(matches!(result, Err(GatewayError::SchemaValidation(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failed_attempt() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result = with_retry(&policy(1), "test", || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(42)
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_surfaces_timeout() {
        let result: Result<(), _> = with_retry(&policy(0), "test", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(GatewayError::Timeout(_))));
    }
}
