use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meshrpc_common::protocol::error::{Result, RpcError};
use tracing::warn;

use crate::policy::Policy;

/// Exponential backoff settings.
///
/// The first retry waits `initial_backoff_ms`; each following retry waits the
/// previous delay times `backoff_multiplier`, capped at `max_backoff_ms`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (excluding initial attempt)
    ///
    /// Total attempts = max_retries + 1
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
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

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Caller-supplied delays; the last one repeats once the list runs out.
    Intervals(Vec<Duration>),
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (zero based).
    pub fn delay(&self, retry: usize) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Intervals(intervals) => intervals
                .get(retry)
                .or_else(|| intervals.last())
                .copied()
                .unwrap_or(Duration::ZERO),
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exponent = retry.min(i32::MAX as usize) as i32;
                let delay_ms = initial.as_millis() as f64 * multiplier.powi(exponent);
                Duration::from_millis(delay_ms.min(max.as_millis() as f64) as u64)
            }
        }
    }
}

type Predicate = Arc<dyn Fn(&RpcError) -> bool + Send + Sync>;
type RetryObserver = Arc<dyn Fn(&RpcError, usize, Duration) + Send + Sync>;

/// Re-runs an operation while it fails with a retryable error.
///
/// By default only communication-class failures are retried; remote errors
/// mean the call already executed and are returned as they are.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    backoff: Backoff,
    is_retryable: Predicate,
    on_retry: Option<RetryObserver>,
}

impl RetryPolicy {
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            backoff: Backoff::None,
            is_retryable: Arc::new(RpcError::is_communication),
            on_retry: None,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_retries).with_backoff(Backoff::Exponential {
            initial: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_intervals(self, intervals: impl IntoIterator<Item = Duration>) -> Self {
        self.with_backoff(Backoff::Intervals(intervals.into_iter().collect()))
    }

    pub fn retry_if(mut self, predicate: impl Fn(&RpcError) -> bool + Send + Sync + 'static) -> Self {
        self.is_retryable = Arc::new(predicate);
        self
    }

    /// Called before each retry with the failure, the retry number (starting
    /// at 1) and the delay about to be slept.
    pub fn on_retry(mut self, observer: impl Fn(&RpcError, usize, Duration) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Policy for RetryPolicy {
    fn execute<T, F, Fut>(&self, action: F) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        async move {
            let mut retries = 0;
            loop {
                let error = match action().await {
                    Ok(value) => return Ok(value),
                    Err(error) => error,
                };

                if retries >= self.max_retries || !(self.is_retryable)(&error) {
                    return Err(error);
                }

                let delay = self.backoff.delay(retries);
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = self.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "operation failed, retrying"
                );
                if let Some(observer) = &self.on_retry {
                    observer(&error, retries, delay);
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn refused() -> RpcError {
        RpcError::communication("10.0.0.1:9001", "connection refused")
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_backoff_ms, 50);
        assert_eq!(config.max_backoff_ms, 5000);
        assert_eq!(config.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(300),
            multiplier: 2.0,
        };
        let delays: Vec<u64> = (0..5).map(|i| backoff.delay(i).as_millis() as u64).collect();
        assert_eq!(delays, vec![50, 100, 200, 300, 300]);
    }

    #[test]
    fn test_interval_sequence_repeats_last() {
        let backoff = Backoff::Intervals(vec![Duration::from_millis(10), Duration::from_millis(30)]);
        assert_eq!(backoff.delay(0), Duration::from_millis(10));
        assert_eq!(backoff.delay(1), Duration::from_millis(30));
        assert_eq!(backoff.delay(7), Duration::from_millis(30));
        assert_eq!(Backoff::Intervals(vec![]).delay(0), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_retry_two_means_three_attempts() {
        let calls = &AtomicUsize::new(0);
        let policy = RetryPolicy::new(2);

        let result = policy
            .execute(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(refused())
            })
            .await;

        assert_eq!(result, Err(refused()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_remote_error_is_not_retried() {
        let calls = &AtomicUsize::new(0);
        let result = RetryPolicy::new(5)
            .execute(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RpcError::remote(500, "boom"))
            })
            .await;

        assert!(result.unwrap_err().is_remote());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = &AtomicUsize::new(0);
        let result = RetryPolicy::new(3)
            .execute(move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RpcError::Timeout(10))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_each_retry_and_delays_are_slept() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let policy = RetryPolicy::new(2)
            .with_intervals([Duration::from_millis(100), Duration::from_millis(200)])
            .on_retry(move |_, attempt, delay| recorder.lock().unwrap().push((attempt, delay)));

        let start = tokio::time::Instant::now();
        let _ = policy
            .execute(|| async { Err::<(), _>(RpcError::Timeout(1)) })
            .await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, Duration::from_millis(100)), (2, Duration::from_millis(200))]
        );
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let calls = &AtomicUsize::new(0);
        let result = RetryPolicy::new(2)
            .retry_if(|e| e.is_remote())
            .execute(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RpcError::remote(503, "busy"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
