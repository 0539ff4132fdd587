//! Per-address health bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use meshrpc_common::AddressModel;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::route_table::RouteTable;

/// Health tracking configuration
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Number of consecutive failures before an address is taken out of rotation
    pub failure_threshold: u32,
    /// Cool-down applied when the threshold is first reached
    pub base_cooldown: Duration,
    /// Maximum cool-down cap
    pub max_cooldown: Duration,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_cooldown: Duration::from_secs(10),
            max_cooldown: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl HealthConfig {
    /// Cool-down for an address with `consecutive_failures` failures in a row.
    ///
    /// Zero below the threshold, `base_cooldown` at the threshold, then
    /// multiplied by `backoff_multiplier` for each further failure up to
    /// `max_cooldown`.
    pub fn calculate_cooldown(&self, consecutive_failures: u32) -> Duration {
        if self.failure_threshold == 0 || consecutive_failures < self.failure_threshold {
            return Duration::ZERO;
        }
        let excess = (consecutive_failures - self.failure_threshold).min(i32::MAX as u32) as i32;
        let base_ms = self.base_cooldown.as_millis() as f64;
        let backoff_ms = base_ms * self.backoff_multiplier.powi(excess);
        let max_ms = self.max_cooldown.as_millis() as f64;
        Duration::from_millis(backoff_ms.min(max_ms) as u64)
    }
}

/// Health state of one address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthRecord {
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    /// Unhealthy until this instant.
    pub broken_until: Option<Instant>,
}

impl HealthRecord {
    fn is_healthy_at(&self, now: Instant) -> bool {
        self.broken_until.map_or(true, |until| now >= until)
    }
}

/// In-memory health view shared by the resolver, the invoker and the prober.
///
/// Every operation is a short, non-blocking map access. Addresses that were
/// never reported are healthy.
#[derive(Debug, Default)]
pub struct HealthTracker {
    records: DashMap<AddressModel, HealthRecord>,
    config: HealthConfig,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            records: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Starts tracking `address` without changing its state.
    pub fn monitor(&self, address: &AddressModel) {
        if !self.records.contains_key(address) {
            self.records.entry(address.clone()).or_default();
        }
    }

    /// Records a failed call. Returns the consecutive failure count.
    pub fn mark_failure(&self, address: &AddressModel) -> u32 {
        let now = Instant::now();
        let mut record = self.records.entry(address.clone()).or_default();
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.last_failure_at = Some(now);

        let cooldown = self.config.calculate_cooldown(record.consecutive_failures);
        if !cooldown.is_zero() {
            record.broken_until = Some(now + cooldown);
            warn!(
                address = %address,
                failures = record.consecutive_failures,
                cooldown_ms = cooldown.as_millis() as u64,
                "address marked unhealthy"
            );
        } else {
            debug!(address = %address, failures = record.consecutive_failures, "address failure recorded");
        }
        record.consecutive_failures
    }

    /// Records a successful call, clearing the failure streak.
    pub fn mark_success(&self, address: &AddressModel) {
        if let Some(mut record) = self.records.get_mut(address) {
            if record.consecutive_failures > 0 {
                info!(address = %address, "address recovered");
            }
            *record = HealthRecord::default();
        }
    }

    pub fn is_healthy(&self, address: &AddressModel) -> bool {
        self.records
            .get(address)
            .map_or(true, |record| record.is_healthy_at(Instant::now()))
    }

    /// Snapshot of the record for `address`, if it is tracked.
    pub fn record(&self, address: &AddressModel) -> Option<HealthRecord> {
        self.records.get(address).map(|r| r.clone())
    }

    /// Drops the state of addresses that no longer serve anything.
    pub fn forget(&self, addresses: &[AddressModel]) {
        for address in addresses {
            if self.records.remove(address).is_some() {
                debug!(address = %address, "health record dropped");
            }
        }
    }

    pub fn tracked(&self) -> usize {
        self.records.len()
    }

    /// Follows route changes and forgets withdrawn addresses that no other
    /// route still uses.
    pub fn watch_routes(
        self: Arc<Self>,
        table: Arc<RouteTable>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut changes = table.subscribe();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => change,
                };
                match change {
                    Ok(change) => {
                        let routes = table.routes();
                        let orphaned: Vec<AddressModel> = change
                            .withdrawn
                            .into_iter()
                            .filter(|a| !routes.iter().any(|r| r.addresses().contains(a)))
                            .collect();
                        self.forget(&orphaned);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "health tracker lagged behind route changes");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
