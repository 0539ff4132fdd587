use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshrpc_common::protocol::error::{Result, RpcError};
use meshrpc_common::AddressModel;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::health::HealthTracker;
use crate::route_table::RouteTable;

/// Checks whether an endpoint is alive.
///
/// Implemented outside this crate (TCP connect, protocol ping, ...).
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, address: &AddressModel) -> Result<()>;
}

/// Result of one probe round for a single address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckStatus {
    Healthy,
    Unhealthy(String),
}

/// Health check configuration.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_millis(2000),
        }
    }
}

/// Periodically probes every routed address and feeds the outcome into the
/// [`HealthTracker`].
pub struct HealthChecker {
    table: Arc<RouteTable>,
    tracker: Arc<HealthTracker>,
    probe: Arc<dyn HealthProbe>,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(
        table: Arc<RouteTable>,
        tracker: Arc<HealthTracker>,
        probe: Arc<dyn HealthProbe>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            table,
            tracker,
            probe,
            config,
        }
    }

    /// Starts the health checker task; it stops when `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(cancel).await;
        })
    }

    /// Main health check loop
    async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        info!(interval_ms = self.config.interval.as_millis() as u64, "health checker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.check_all().await;
                }
            }
        }

        info!("health checker stopped");
    }

    /// Probes every distinct routed address once, in parallel.
    pub async fn check_all(&self) -> Vec<(AddressModel, HealthCheckStatus)> {
        let addresses: BTreeSet<AddressModel> = self
            .table
            .routes()
            .iter()
            .flat_map(|route| route.addresses().iter().cloned())
            .collect();

        let checks = addresses.into_iter().map(|address| async move {
            let status = match self.check_address(&address).await {
                Ok(()) => HealthCheckStatus::Healthy,
                Err(e) => HealthCheckStatus::Unhealthy(e.to_string()),
            };
            (address, status)
        });
        let results = futures::future::join_all(checks).await;

        for (address, status) in &results {
            self.apply(address, status);
        }
        results
    }

    async fn check_address(&self, address: &AddressModel) -> Result<()> {
        tokio::time::timeout(self.config.timeout, self.probe.probe(address))
            .await
            .map_err(|_| RpcError::Timeout(self.config.timeout.as_millis() as u64))?
    }

    fn apply(&self, address: &AddressModel, status: &HealthCheckStatus) {
        match status {
            HealthCheckStatus::Healthy => self.tracker.mark_success(address),
            HealthCheckStatus::Unhealthy(reason) => {
                let failures = self.tracker.mark_failure(address);
                if failures == self.tracker.config().failure_threshold {
                    warn!(address = %address, reason = %reason, "health probe threshold reached");
                } else {
                    debug!(address = %address, failures, reason = %reason, "health probe failed");
                }
            }
        }
    }
}
