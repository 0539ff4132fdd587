//! Wiring of the whole client from a [`ClientConfig`].

use std::sync::Arc;

use meshrpc_common::protocol::error::Result;
use meshrpc_common::ServiceRoute;
use meshrpc_routing::{
    AddressResolver, DiscoveryRefresher, HealthChecker, HealthProbe, HealthTracker, RouteTable,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ClientConfig;
use crate::connection::{ConnectionFactory, TcpConnector};
use crate::diagnostics::Diagnostics;
use crate::fallback::FallbackRegistry;
use crate::invoker::ClusterInvoker;

/// A running client: route table, health tracking, connections and the
/// invoker, plus the background tasks that keep them consistent.
pub struct MeshClient {
    table: Arc<RouteTable>,
    health: Arc<HealthTracker>,
    connections: Arc<ConnectionFactory>,
    invoker: Arc<ClusterInvoker>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshClient {
    /// Builds the client and starts its background tasks.
    ///
    /// Static routes from the config are loaded into the route table. The
    /// health prober only runs when `probe` is given and enabled in config.
    pub fn start(
        config: &ClientConfig,
        refresher: Arc<dyn DiscoveryRefresher>,
        probe: Option<Arc<dyn HealthProbe>>,
    ) -> Result<Self> {
        config.validate()?;

        let table = Arc::new(RouteTable::new());
        table.set_routes(config.routes()?);

        let health = Arc::new(HealthTracker::new(config.health_config()));
        let resolver = Arc::new(AddressResolver::new(
            Arc::clone(&table),
            Arc::clone(&health),
            refresher,
        ));
        let connections = Arc::new(ConnectionFactory::new(
            Arc::new(TcpConnector::new(config.channel_config())),
            Arc::new(Diagnostics::new()),
        ));
        let commands = Arc::new(config.command_provider()?);
        let invoker = Arc::new(
            ClusterInvoker::new(resolver, Arc::clone(&connections), commands)
                .with_fallbacks(Arc::new(FallbackRegistry::new())),
        );

        let cancel = CancellationToken::new();
        let mut tasks = vec![
            Arc::clone(&health).watch_routes(Arc::clone(&table), cancel.clone()),
            Arc::clone(&connections).watch_routes(Arc::clone(&table), cancel.clone()),
        ];
        if let Some(probe) = probe.filter(|_| config.health.check_enabled) {
            let checker = HealthChecker::new(
                Arc::clone(&table),
                Arc::clone(&health),
                probe,
                config.health_check_config(),
            );
            tasks.push(checker.spawn(cancel.clone()));
        }

        info!(routes = table.len(), "mesh client started");
        Ok(Self {
            table,
            health,
            connections,
            invoker,
            cancel,
            tasks,
        })
    }

    pub fn invoker(&self) -> &Arc<ClusterInvoker> {
        &self.invoker
    }

    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn connections(&self) -> &Arc<ConnectionFactory> {
        &self.connections
    }

    pub fn fallbacks(&self) -> &Arc<FallbackRegistry> {
        self.invoker.fallbacks()
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        self.connections.diagnostics()
    }

    pub fn routes(&self) -> Vec<Arc<ServiceRoute>> {
        self.table.routes()
    }

    /// Stops background tasks and closes every connection. Pending calls
    /// fail with `ConnectionClosed`.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        self.connections.close_all().await;
        info!("mesh client stopped");
    }
}
