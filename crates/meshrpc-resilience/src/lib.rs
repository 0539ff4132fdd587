//! MeshRPC Resilience
//!
//! Composable policies around fallible async operations:
//!
//! - [`CircuitBreakerPolicy`]: short-circuits after repeated failures and
//!   replays the last real error while open
//! - [`RetryPolicy`]: re-runs retryable failures with a configurable delay
//!   schedule
//! - [`PolicyWrap`]: explicit outer/inner composition of two policies
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use meshrpc_resilience::{CircuitBreakerConfig, CircuitBreakerPolicy, Policy, RetryPolicy};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let policy = CircuitBreakerPolicy::new("Echo", CircuitBreakerConfig::default())
//!     .wrap(RetryPolicy::new(2).with_intervals([Duration::from_millis(10)]));
//!
//! let value = policy.execute(|| async { Ok(42) }).await;
//! assert_eq!(value, Ok(42));
//! # }
//! ```

pub mod circuit_breaker;
pub mod policy;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerPolicy, CircuitBreakerState, CircuitBreakers,
};
pub use policy::{NoOpPolicy, Policy, PolicyWrap};
pub use retry::{Backoff, RetryConfig, RetryPolicy};
