//! Circuit breaking.
//!
//! A breaker counts consecutive breakable failures. Once the count reaches
//! the threshold it opens for `break_duration`: calls fail immediately with
//! the last real failure instead of running. When the duration has passed a
//! single trial call is let through (half-open); its success closes the
//! breaker, its failure opens it again.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use meshrpc_common::protocol::error::{Result, RpcError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::policy::Policy;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    /// Normal operation, requests flow through
    Closed,
    /// Circuit is tripped, requests fail fast without running
    Open,
    /// Break duration elapsed; the next call is a trial
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive breakable failures before tripping the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open
    pub break_duration: Duration,
    /// Also trip when this percentage of calls inside `sampling_window`
    /// failed. `None` disables rate based tripping.
    pub error_threshold_percentage: Option<u8>,
    pub sampling_window: Duration,
    /// Calls needed inside the window before the error rate is considered
    pub minimum_throughput: u32,
    /// Always short-circuit
    pub force_open: bool,
    /// Never short-circuit, whatever the failure count
    pub force_closed: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
            error_threshold_percentage: None,
            sampling_window: Duration::from_secs(10),
            minimum_throughput: 20,
            force_open: false,
            force_closed: false,
        }
    }
}

#[derive(Debug, Default)]
struct BreakerInner {
    failure_count: u32,
    break_until: Option<Instant>,
    last_error: Option<RpcError>,
    trial_in_flight: bool,
    /// (when, failed) for error rate tracking.
    samples: VecDeque<(Instant, bool)>,
}

type Predicate = Arc<dyn Fn(&RpcError) -> bool + Send + Sync>;

/// Circuit breaker around one protected operation.
pub struct CircuitBreakerPolicy {
    name: String,
    config: CircuitBreakerConfig,
    is_breakable: Predicate,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreakerPolicy {
    /// Creates a breaker that counts communication-class failures.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            is_breakable: Arc::new(RpcError::is_communication),
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    pub fn break_on(mut self, predicate: impl Fn(&RpcError) -> bool + Send + Sync + 'static) -> Self {
        self.is_breakable = Arc::new(predicate);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitBreakerState {
        if self.config.force_open {
            return CircuitBreakerState::Open;
        }
        if self.config.force_closed {
            return CircuitBreakerState::Closed;
        }
        match self.lock().break_until {
            None => CircuitBreakerState::Closed,
            Some(until) if Instant::now() < until => CircuitBreakerState::Open,
            Some(_) => CircuitBreakerState::HalfOpen,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn last_error(&self) -> Option<RpcError> {
        self.lock().last_error.clone()
    }

    /// Closes the circuit and forgets every recorded failure.
    pub fn reset(&self) {
        *self.lock() = BreakerInner::default();
    }

    /// Admits a call, or rejects it with the error to replay.
    fn acquire(&self) -> Result<Permit<'_>> {
        if self.config.force_closed {
            return Ok(Permit::new(self, false));
        }

        let mut inner = self.lock();
        if self.config.force_open {
            return Err(self.short_circuit(&inner));
        }

        let Some(until) = inner.break_until else {
            return Ok(Permit::new(self, false));
        };
        if Instant::now() < until || inner.trial_in_flight {
            return Err(self.short_circuit(&inner));
        }

        inner.trial_in_flight = true;
        debug!(breaker = %self.name, "circuit half-open, admitting trial call");
        Ok(Permit::new(self, true))
    }

    fn short_circuit(&self, inner: &BreakerInner) -> RpcError {
        inner
            .last_error
            .clone()
            .unwrap_or_else(|| RpcError::CircuitOpen(self.name.clone()))
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial || inner.break_until.is_some() {
            info!(breaker = %self.name, "circuit closed");
        }
        inner.failure_count = 0;
        inner.break_until = None;
        inner.last_error = None;
        inner.trial_in_flight = false;
        self.sample(&mut inner, false);
    }

    fn on_failure(&self, trial: bool, error: &RpcError) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        if !(self.is_breakable)(error) {
            return;
        }

        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_error = Some(error.clone());
        self.sample(&mut inner, true);

        let over_threshold = inner.failure_count >= self.config.failure_threshold;
        if trial || over_threshold || self.error_rate_exceeded(&inner) {
            inner.break_until = Some(Instant::now() + self.config.break_duration);
            if !self.config.force_closed {
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    break_ms = self.config.break_duration.as_millis() as u64,
                    error = %error,
                    "circuit opened"
                );
            }
        }
    }

    fn sample(&self, inner: &mut BreakerInner, failed: bool) {
        if self.config.error_threshold_percentage.is_none() {
            return;
        }
        let now = Instant::now();
        inner.samples.push_back((now, failed));
        while let Some((at, _)) = inner.samples.front() {
            if now.duration_since(*at) > self.config.sampling_window {
                inner.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn error_rate_exceeded(&self, inner: &BreakerInner) -> bool {
        let Some(percentage) = self.config.error_threshold_percentage else {
            return false;
        };
        let total = inner.samples.len();
        if total == 0 || total < self.config.minimum_throughput as usize {
            return false;
        }
        let failed = inner.samples.iter().filter(|(_, failed)| *failed).count();
        failed * 100 >= total * usize::from(percentage)
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for CircuitBreakerPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerPolicy")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// An admitted call. A trial that is dropped without an outcome (the caller
/// was cancelled) frees the half-open slot for the next caller.
struct Permit<'a> {
    breaker: &'a CircuitBreakerPolicy,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreakerPolicy, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn settle<T>(mut self, outcome: &Result<T>) {
        self.settled = true;
        match outcome {
            Ok(_) => self.breaker.on_success(self.trial),
            Err(error) => self.breaker.on_failure(self.trial, error),
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl Policy for CircuitBreakerPolicy {
    fn execute<T, F, Fut>(&self, action: F) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        async move {
            let permit = self.acquire()?;
            let outcome = action().await;
            permit.settle(&outcome);
            outcome
        }
    }
}

/// Breakers keyed by service id.
///
/// A breaker is rebuilt, with fresh state, when the configuration it was
/// created with changes.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    breakers: DashMap<String, Arc<CircuitBreakerPolicy>>,
}

impl CircuitBreakers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, service_id: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreakerPolicy> {
        if let Some(existing) = self.breakers.get(service_id) {
            if existing.config() == config {
                return Arc::clone(existing.value());
            }
        }

        let mut entry = self
            .breakers
            .entry(service_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreakerPolicy::new(service_id, config.clone())));
        if entry.config() != config {
            debug!(service_id, "breaker configuration changed, rebuilding");
            *entry = Arc::new(CircuitBreakerPolicy::new(service_id, config.clone()));
        }
        Arc::clone(entry.value())
    }

    pub fn get(&self, service_id: &str) -> Option<Arc<CircuitBreakerPolicy>> {
        self.breakers.get(service_id).map(|b| Arc::clone(b.value()))
    }

    pub fn remove(&self, service_id: &str) {
        self.breakers.remove(service_id);
    }
}
