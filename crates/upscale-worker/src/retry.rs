//! Bounded exponential backoff around external calls.
//!
//! Every object store, job store and inference call made by the pipeline
//! goes through a [`RetryExecutor`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::WorkerError;
use crate::metrics;

/// Failure of an operation run through a [`RetryExecutor`].
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed.
    Exhausted {
        operation: String,
        attempts: u32,
        last_error: E,
    },
    /// The predicate classified the error as permanent.
    Aborted { operation: String, error: E },
}

impl<E> RetryError<E> {
    /// The error of the final attempt.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last_error, .. } => last_error,
            RetryError::Aborted { error, .. } => error,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

impl<E: Display> Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Exhausted {
                operation,
                attempts,
                last_error,
            } => write!(f, "{} failed after {} attempts: {}", operation, attempts, last_error),
            RetryError::Aborted { operation, error } => write!(f, "{} failed: {}", operation, error),
        }
    }
}

/// Exhaustion becomes `RetriesExhausted`; a permanent failure keeps its own
/// classification.
impl<E> From<RetryError<E>> for WorkerError
where
    E: Into<WorkerError> + Display,
{
    fn from(e: RetryError<E>) -> Self {
        match e {
            RetryError::Exhausted {
                operation,
                attempts,
                last_error,
            } => WorkerError::RetriesExhausted {
                operation,
                attempts,
                last_error: last_error.to_string(),
            },
            RetryError::Aborted { error, .. } => error.into(),
        }
    }
}

/// Retries an async operation with exponential backoff.
///
/// After failed attempt `n` it sleeps `base_delay * 2^(n-1)`, capped at
/// `max_delay`, until `max_attempts` calls have been made.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    /// Total calls, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Operation name for logs and metrics
    pub operation_name: String,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            operation_name: "operation".to_string(),
        }
    }
}

impl RetryExecutor {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            ..Default::default()
        }
    }

    /// Same backoff settings under another operation name.
    pub fn named(&self, operation_name: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            ..self.clone()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `operation` until it succeeds or `max_attempts` calls failed.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_if(operation, |_| true).await
    }

    /// Like [`execute`](Self::execute), but stops at the first error for
    /// which `should_retry` returns false.
    pub async fn execute_if<F, Fut, T, E, P>(
        &self,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !should_retry(&e) => {
                    return Err(RetryError::Aborted {
                        operation: self.operation_name.clone(),
                        error: e,
                    });
                }
                Err(e) if attempt >= self.max_attempts => {
                    return Err(RetryError::Exhausted {
                        operation: self.operation_name.clone(),
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation = %self.operation_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after failure"
                    );
                    metrics::record_retry(&self.operation_name);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(name: &str) -> RetryExecutor {
        RetryExecutor::new(name).with_base_delay(Duration::from_millis(1))
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let retry = RetryExecutor::new("test").with_base_delay(Duration::from_millis(100));

        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_capped() {
        let retry = RetryExecutor::new("test")
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5));

        assert_eq!(retry.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(retry.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_exhausted_after_exactly_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = fast("infer")
            .with_max_attempts(3)
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("endpoint timeout") }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(RetryError::Exhausted { attempts, last_error, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "endpoint timeout");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eventual_success() {
        let calls = AtomicU32::new(0);

        let value = fast("fetch")
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_aborts_immediately() {
        let calls = AtomicU32::new(0);

        let result = fast("fetch")
            .with_max_attempts(5)
            .execute_if(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("not found") }
                },
                |e| *e != "not found",
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Aborted { .. })));
    }

    #[tokio::test]
    async fn test_exhaustion_maps_to_worker_error() {
        let result = fast("upload")
            .with_max_attempts(2)
            .execute(|| async { Err::<(), _>(upscale_storage::StorageError::upload_failed("503")) })
            .await;

        let err: WorkerError = result.unwrap_err().into();
        match err {
            WorkerError::RetriesExhausted { operation, attempts, .. } => {
                assert_eq!(operation, "upload");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
