use std::future::Future;

use meshrpc_common::protocol::error::Result;

/// A resilience policy wrapping an asynchronous operation.
///
/// The operation is a factory so that a policy can run it more than once
/// (retry) or not at all (an open breaker). Policies never decide their own
/// nesting; callers build chains explicitly with [`Policy::wrap`].
pub trait Policy: Send + Sync {
    /// Runs `action` under this policy and returns its value.
    fn execute<T, F, Fut>(&self, action: F) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send;

    /// Runs `action` for its effect, keeping only the outcome.
    fn run<T, F, Fut>(&self, action: F) -> impl Future<Output = Result<()>> + Send
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        async move { self.execute(action).await.map(|_| ()) }
    }

    /// Makes `self` the outer layer around `inner`.
    fn wrap<I: Policy>(self, inner: I) -> PolicyWrap<Self, I>
    where
        Self: Sized,
    {
        PolicyWrap::new(self, inner)
    }
}

/// Two policies composed so that every execution of `outer` runs the whole
/// of `inner`.
///
/// `retry.wrap(breaker)` retries calls that the breaker rejects or lets
/// through; `breaker.wrap(retry)` counts one breaker outcome per retried call.
#[derive(Debug)]
pub struct PolicyWrap<O, I> {
    outer: O,
    inner: I,
}

impl<O: Policy, I: Policy> PolicyWrap<O, I> {
    pub fn new(outer: O, inner: I) -> Self {
        Self { outer, inner }
    }

    pub fn outer(&self) -> &O {
        &self.outer
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }
}

impl<O: Policy, I: Policy> Policy for PolicyWrap<O, I> {
    fn execute<T, F, Fut>(&self, action: F) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        async move {
            let action = &action;
            let inner = &self.inner;
            self.outer.execute(move || inner.execute(action)).await
        }
    }
}

/// Runs the operation once, unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpPolicy;

impl Policy for NoOpPolicy {
    fn execute<T, F, Fut>(&self, action: F) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        action()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrpc_common::RpcError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_noop_runs_once() {
        let calls = &AtomicUsize::new(0);
        let result = NoOpPolicy
            .execute(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RpcError::Timeout(5))
            })
            .await;
        assert_eq!(result, Err(RpcError::Timeout(5)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_discards_value() {
        let result = NoOpPolicy.run(|| async { Ok(42) }).await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_wrap_of_noops_is_transparent() {
        let policy = NoOpPolicy.wrap(NoOpPolicy);
        assert_eq!(policy.execute(|| async { Ok("hi") }).await, Ok("hi"));
    }
}
