use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meshrpc_common::protocol::error::{Result, RpcError};
use meshrpc_common::transport::{InboundHandler, JsonCodec, MessageCodec, TcpChannel, TcpChannelConfig};
use meshrpc_common::AddressModel;
use meshrpc_routing::RouteTable;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::diagnostics::Diagnostics;
use crate::multiplexer::TransportClient;

/// Opens a multiplexed connection to one endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &AddressModel, diagnostics: Arc<Diagnostics>) -> Result<Arc<TransportClient>>;
}

/// Connector for the framed TCP channel.
pub struct TcpConnector {
    codec: Arc<dyn MessageCodec>,
    config: TcpChannelConfig,
}

impl TcpConnector {
    pub fn new(config: TcpChannelConfig) -> Self {
        Self {
            codec: Arc::new(JsonCodec),
            config,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(TcpChannelConfig::default())
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &AddressModel, diagnostics: Arc<Diagnostics>) -> Result<Arc<TransportClient>> {
        let channel = Arc::new(
            TcpChannel::connect(&address.to_string(), Arc::clone(&self.codec), &self.config).await?,
        );
        let client = Arc::new(TransportClient::new(address.clone(), channel.clone(), diagnostics));

        let handler: Arc<dyn InboundHandler> = client.clone();
        channel.start_reading(Arc::downgrade(&handler));
        Ok(client)
    }
}

/// One [`TransportClient`] per endpoint, created on first use and replaced
/// once it has been closed.
///
/// After [`close_all`](Self::close_all) the factory is shut down: new
/// requests for a client fail with `ConnectionClosed`, and a connect still in
/// flight closes its client instead of caching it.
pub struct ConnectionFactory {
    connector: Arc<dyn Connector>,
    diagnostics: Arc<Diagnostics>,
    clients: DashMap<AddressModel, Arc<TransportClient>>,
    /// Serializes connection attempts per address. An entry is only dropped
    /// when nobody holds or waits on its mutex.
    connecting: DashMap<AddressModel, Arc<Mutex<()>>>,
    closed: AtomicBool,
}

impl ConnectionFactory {
    pub fn new(connector: Arc<dyn Connector>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            connector,
            diagnostics,
            clients: DashMap::new(),
            connecting: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn tcp(config: TcpChannelConfig) -> Self {
        Self::new(Arc::new(TcpConnector::new(config)), Arc::new(Diagnostics::new()))
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Live client for `address`, connecting if needed.
    pub async fn client(&self, address: &AddressModel) -> Result<Arc<TransportClient>> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed(address.to_string()));
        }
        if let Some(client) = self.live(address) {
            return Ok(client);
        }

        let lock = self.connect_lock(address);
        let _connecting = lock.lock().await;

        // Another task may have connected while we waited.
        if let Some(client) = self.live(address) {
            return Ok(client);
        }
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed(address.to_string()));
        }

        let client = self
            .connector
            .connect(address, Arc::clone(&self.diagnostics))
            .await?;
        self.clients.insert(address.clone(), Arc::clone(&client));

        // close_all may have drained the map while we were connecting.
        if self.is_closed() {
            self.clients.remove_if(address, |_, c| Arc::ptr_eq(c, &client));
            client.close().await;
            debug!(address = %address, "factory closed during connect, discarding connection");
            return Err(RpcError::ConnectionClosed(address.to_string()));
        }
        info!(address = %address, "connection established");
        Ok(client)
    }

    fn connect_lock(&self, address: &AddressModel) -> Arc<Mutex<()>> {
        Arc::clone(self.connecting.entry(address.clone()).or_default().value())
    }

    /// Drops the connect lock for `address` unless someone still uses it.
    fn prune_lock(&self, address: &AddressModel) {
        // Clones are only taken under the shard lock held by remove_if.
        self.connecting.remove_if(address, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn live(&self, address: &AddressModel) -> Option<Arc<TransportClient>> {
        let client = self.clients.get(address).map(|c| Arc::clone(c.value()))?;
        if client.is_closed() {
            debug!(address = %address, "discarding closed connection");
            self.clients.remove_if(address, |_, c| Arc::ptr_eq(c, &client));
            return None;
        }
        Some(client)
    }

    /// Closes and forgets the connection to `address`.
    ///
    /// Waits for a connect to `address` in flight, so that its client is
    /// closed too rather than cached afterwards.
    pub async fn remove(&self, address: &AddressModel) {
        let lock = self.connect_lock(address);
        let removed = {
            let _connecting = lock.lock().await;
            self.clients.remove(address)
        };
        drop(lock);
        self.prune_lock(address);

        if let Some((_, client)) = removed {
            client.close().await;
        }
    }

    /// Closes every connection and shuts the factory down.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let addresses: Vec<AddressModel> = self.clients.iter().map(|c| c.key().clone()).collect();
        let mut clients = Vec::with_capacity(addresses.len());
        for address in addresses {
            if let Some((_, client)) = self.clients.remove(&address) {
                clients.push(client);
            }
        }
        self.connecting.retain(|_, lock| Arc::strong_count(lock) > 1);
        for client in clients {
            client.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Closes connections to addresses that no route uses anymore.
    pub fn watch_routes(self: Arc<Self>, table: Arc<RouteTable>, cancel: CancellationToken) -> JoinHandle<()> {
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
                        for address in change.withdrawn {
                            if !routes.iter().any(|r| r.addresses().contains(&address)) {
                                self.remove(&address).await;
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connection factory lagged behind route changes");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
