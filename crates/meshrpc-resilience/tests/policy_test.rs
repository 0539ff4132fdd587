//! Policy composition tests
//!
//! Breaker and retry assembled in both orders, the way callers chain them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use meshrpc_common::RpcError;
use meshrpc_resilience::{
    CircuitBreakerConfig, CircuitBreakerPolicy, CircuitBreakerState, Policy, RetryPolicy,
};

fn refused() -> RpcError {
    RpcError::communication("127.0.0.1:9001", "connection refused")
}

fn breaker(threshold: u32) -> CircuitBreakerPolicy {
    CircuitBreakerPolicy::new(
        "Echo",
        CircuitBreakerConfig {
            failure_threshold: threshold,
            break_duration: Duration::from_secs(30),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_breaker_outside_retry_counts_once_per_call() {
    let policy = breaker(3).wrap(RetryPolicy::new(2));
    let calls = &AtomicUsize::new(0);

    let result = policy
        .execute(move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(refused())
        })
        .await;

    assert_eq!(result, Err(refused()));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(policy.outer().failure_count(), 1);
}

#[tokio::test]
async fn test_retry_outside_breaker_stops_running_once_open() {
    let policy = RetryPolicy::new(5).wrap(breaker(2));
    let calls = &AtomicUsize::new(0);

    let result = policy
        .execute(move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(refused())
        })
        .await;

    // Two real attempts trip the breaker; the remaining retries are rejected
    // with the replayed error without reaching the operation.
    assert_eq!(result, Err(refused()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(policy.inner().state(), CircuitBreakerState::Open);
}

#[tokio::test]
async fn test_run_observes_outcome_only() {
    let policy = breaker(3).wrap(RetryPolicy::new(1));
    let seen = &AtomicUsize::new(0);

    let outcome = policy
        .run(move || async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok("ignored")
        })
        .await;

    assert_eq!(outcome, Ok(()));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_policy_future_is_send() {
    let policy = std::sync::Arc::new(breaker(3).wrap(RetryPolicy::new(1)));
    let handle = tokio::spawn({
        let policy = std::sync::Arc::clone(&policy);
        async move { policy.execute(|| async { Ok::<_, RpcError>(7) }).await }
    });
    assert_eq!(handle.await.unwrap(), Ok(7));
}
