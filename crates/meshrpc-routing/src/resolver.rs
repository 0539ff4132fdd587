//! Service id to endpoint resolution.

use std::sync::Arc;

use meshrpc_common::protocol::error::{Result, RpcError};
use meshrpc_common::{AddressModel, ServiceRoute};
use tracing::{debug, trace};

use crate::health::HealthTracker;
use crate::route_table::{DiscoveryRefresher, RouteTable};
use crate::selector::{SelectContext, SelectorMode, Selectors};

/// Turns a service id and optional routing key into one concrete address.
///
/// Resolution order:
///
/// 1. Look the route up; on a miss ask the [`DiscoveryRefresher`] once and
///    look again.
/// 2. Drop addresses the caller already tried, unless that leaves nothing.
/// 3. Keep the healthy addresses; if none are healthy, keep them all.
/// 4. Let the selector for the requested mode pick one.
pub struct AddressResolver {
    table: Arc<RouteTable>,
    health: Arc<HealthTracker>,
    refresher: Arc<dyn DiscoveryRefresher>,
    selectors: Selectors,
    default_mode: SelectorMode,
}

impl AddressResolver {
    pub fn new(
        table: Arc<RouteTable>,
        health: Arc<HealthTracker>,
        refresher: Arc<dyn DiscoveryRefresher>,
    ) -> Self {
        Self {
            table,
            health,
            refresher,
            selectors: Selectors::new(),
            default_mode: SelectorMode::default(),
        }
    }

    pub fn with_default_mode(mut self, mode: SelectorMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub async fn resolve(&self, service_id: &str, routing_key: Option<&str>) -> Result<AddressModel> {
        self.resolve_with(service_id, routing_key, self.default_mode, &[])
            .await
    }

    pub async fn resolve_with(
        &self,
        service_id: &str,
        routing_key: Option<&str>,
        mode: SelectorMode,
        excluded: &[AddressModel],
    ) -> Result<AddressModel> {
        let route = self.route(service_id).await?;
        self.select_from(&route, routing_key, mode, excluded)
    }

    /// Current route for `service_id`, refreshing discovery once on a miss.
    pub async fn route(&self, service_id: &str) -> Result<Arc<ServiceRoute>> {
        if let Some(route) = self.table.get_route(service_id) {
            return Ok(route);
        }

        debug!(service_id, "route miss, requesting discovery refresh");
        self.refresher.refresh(service_id).await;

        self.table
            .get_route(service_id)
            .ok_or_else(|| RpcError::resolution(service_id, "no route registered"))
    }

    /// Picks an address out of an already fetched route.
    pub fn select_from(
        &self,
        route: &ServiceRoute,
        routing_key: Option<&str>,
        mode: SelectorMode,
        excluded: &[AddressModel],
    ) -> Result<AddressModel> {
        let service_id = route.service_id();
        if !route.is_active() {
            return Err(RpcError::resolution(service_id, "route has no addresses"));
        }

        let mut candidates: Vec<AddressModel> = route
            .addresses()
            .iter()
            .filter(|a| !excluded.contains(a))
            .cloned()
            .collect();
        if candidates.is_empty() {
            trace!(service_id, "every address already tried, ignoring exclusions");
            candidates = route.addresses().to_vec();
        }

        let healthy: Vec<AddressModel> = candidates
            .iter()
            .filter(|a| self.health.is_healthy(a))
            .cloned()
            .collect();
        if healthy.is_empty() {
            debug!(service_id, candidates = candidates.len(), "no healthy address, using all candidates");
        } else {
            candidates = healthy;
        }

        let ctx = SelectContext {
            service_id,
            routing_key,
            candidates: &candidates,
        };
        self.selectors
            .for_mode(mode)
            .select(&ctx)
            .ok_or_else(|| RpcError::resolution(service_id, "selector returned no address"))
    }
}
