//! Retry logic with exponential backoff for idempotent remote calls
//!
//! Only request/reply calls go through here. Streaming uploads consume a
//! single-pass chunker and are never retried.

use crate::config::RetryConfig;
use crate::error::{RemoteError, Result};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, backoff::Backoff};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Run `f` once, or under [`retry_with_backoff`] when retries are configured
pub async fn with_retry<F, Fut, T>(
    config: Option<&RetryConfig>,
    operation_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match config {
        Some(config) => retry_with_backoff(config, operation_name, f).await,
        None => f().await,
    }
}

/// Retry a fallible async operation with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = create_backoff(config);
    let mut attempts = 0;

    loop {
        attempts += 1;

        let err = match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts = attempts,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => err,
        };

        if !is_retryable(&err) {
            debug!(
                operation = operation_name,
                error = %err,
                "Error is not retryable, failing immediately"
            );
            return Err(err);
        }

        if attempts >= config.max_attempts {
            warn!(
                operation = operation_name,
                attempts = attempts,
                error = %err,
                "Operation failed after maximum retries"
            );
            return Err(RemoteError::retry_exhausted(
                operation_name,
                attempts,
                err.to_string(),
            ));
        }

        match backoff.next_backoff() {
            Some(duration) => {
                warn!(
                    operation = operation_name,
                    attempts = attempts,
                    error = %err,
                    retry_in_ms = duration.as_millis(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(duration).await;
            }
            None => {
                return Err(RemoteError::retry_exhausted(
                    operation_name,
                    attempts,
                    err.to_string(),
                ));
            }
        }
    }
}

/// Create exponential backoff from config
fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.initial_backoff_ms))
        .with_max_interval(Duration::from_millis(config.max_backoff_ms))
        .with_multiplier(config.backoff_multiplier)
        .with_max_elapsed_time(None) // bounded by max_attempts
        .build()
}

/// Transport failures are retryable; anything the server or the stream said
/// about the content is not
fn is_retryable(err: &RemoteError) -> bool {
    match err {
        RemoteError::ConnectionFailed { .. } => true,

        RemoteError::Grpc { source, .. } => matches!(
            source.code(),
            tonic::Code::Unavailable
                | tonic::Code::ResourceExhausted
                | tonic::Code::DeadlineExceeded
                | tonic::Code::Internal
                | tonic::Code::Unknown
        ),

        RemoteError::Timeout { .. } => true,

        RemoteError::NotFound { .. }
        | RemoteError::ProtocolViolation { .. }
        | RemoteError::RemoteFailure { .. }
        | RemoteError::ResourceExceeded { .. }
        | RemoteError::Unsupported { .. }
        | RemoteError::Io { .. }
        | RemoteError::Config(_)
        | RemoteError::InvalidDigest(_)
        | RemoteError::Merkle { .. }
        | RemoteError::RetryExhausted { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::Digest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let config = RetryConfig::default();
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(&config, "test", move || {
            let cc = call_count_clone.clone();
            async move {
                cc.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RemoteError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_success_after_unavailable() {
        let config = fast_config(3);
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(&config, "test", move || {
            let cc = call_count_clone.clone();
            async move {
                let count = cc.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(RemoteError::grpc(
                        "CasService.Lookup",
                        tonic::Status::unavailable("connection reset"),
                    ))
                } else {
                    Ok::<_, RemoteError>(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let config = fast_config(2);
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(&config, "test", move || {
            let cc = call_count_clone.clone();
            async move {
                cc.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(RemoteError::timeout("test", 1))
            }
        })
        .await;

        assert_eq!(call_count.load(Ordering::SeqCst), 2);
        assert!(matches!(
            result.unwrap_err(),
            RemoteError::RetryExhausted { .. }
        ));
    }

    #[tokio::test]
    async fn test_server_status_is_not_retried() {
        let config = fast_config(5);
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(&config, "test", move || {
            let cc = call_count_clone.clone();
            async move {
                cc.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(RemoteError::remote_failure("CasService.Lookup", "bad"))
            }
        })
        .await;

        assert!(matches!(result, Err(RemoteError::RemoteFailure { .. })));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_miss_passes_through_unwrapped() {
        let config = fast_config(5);
        let digest = Digest::from_bytes(b"absent");

        let result: Result<()> =
            retry_with_backoff(&config, "test", move || async move {
                Err(RemoteError::not_found(digest))
            })
            .await;
        assert!(result.unwrap_err().is_cache_miss());
    }

    #[tokio::test]
    async fn test_without_config_runs_once() {
        let counter = AtomicUsize::new(0);
        let call_count = &counter;

        let result: Result<()> = with_retry(None, "test", move || async move {
            call_count.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::timeout("test", 1))
        })
        .await;

        assert!(matches!(result, Err(RemoteError::Timeout { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
