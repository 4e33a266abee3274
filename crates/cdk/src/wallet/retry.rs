//! Timeouts and retries for mint calls
//!
//! Only read-only calls go through [`retry_read`]. Mint, melt and swap requests use
//! [`with_timeout`] and are never repeated automatically.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryPolicy;
use crate::Error;

/// Run `fut`, failing with [`Error::Timeout`] once `timeout` has passed
pub async fn with_timeout<T, Fut>(timeout: Duration, fut: Fut) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, Error>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::Timeout)?
}

/// Run a read-only call with bounded exponential backoff
///
/// Each attempt has its own `timeout`. Errors that are not [`Error::is_retriable`] return
/// immediately.
pub async fn retry_read<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    name: &str,
    mut call: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match with_timeout(timeout, call()).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt < max_attempts => {
                let delay = policy.delay(attempt);
                tracing::debug!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                    name,
                    attempt,
                    max_attempts,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retriable() {
                    tracing::warn!("{} failed after {} attempts: {}", name, attempt, err);
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_retries_transport_failures() {
        let calls = AtomicU32::new(0);

        let result = retry_read(&policy(), Duration::from_secs(1), "keysets", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::TransportFailure("connection reset".to_string()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<(), Error> =
            retry_read(&policy(), Duration::from_secs(1), "keysets", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::TransportFailure("offline".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::TransportFailure(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_protocol_errors_are_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), Error> =
            retry_read(&policy(), Duration::from_secs(1), "quote state", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::ProtocolError("quote not found".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::ProtocolError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let result: Result<(), Error> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout)));
    }
}
