//! Loopback servers and wiring shared by the client integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meshrpc_client::{ClusterInvoker, ConnectionFactory, ServiceCommand, ServiceCommandProvider};
use meshrpc_common::transport::{
    read_frame, write_frame, JsonCodec, MessageCodec, TcpChannelConfig, MAX_MESSAGE_SIZE,
};
use meshrpc_common::{AddressModel, InvokeResponse, ServiceDescriptor, ServiceRoute};
use meshrpc_routing::{AddressResolver, HealthTracker, NoopRefresher, RouteTable};
use serde_json::json;
use tokio::net::TcpListener;

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Answers with its port, the parameters and request metadata.
    Echo,
    /// Answers every request with a remote failure.
    Fail(i32),
    /// Echoes after a delay.
    Delay(Duration),
}

pub struct TestServer {
    pub address: AddressModel,
    pub requests: Arc<AtomicUsize>,
}

impl TestServer {
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

pub async fn spawn_server(behavior: Behavior) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let requests = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&requests);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                while let Ok(Some(frame)) = read_frame(&mut stream, MAX_MESSAGE_SIZE).await {
                    let request = JsonCodec.decode_request(&frame).unwrap();
                    counter.fetch_add(1, Ordering::SeqCst);

                    let response = match behavior {
                        Behavior::Fail(status) => InvokeResponse::failure(request.id, status, "service failed"),
                        Behavior::Echo | Behavior::Delay(_) => {
                            if let Behavior::Delay(delay) = behavior {
                                tokio::time::sleep(delay).await;
                            }
                            InvokeResponse::success(
                                request.id,
                                json!({
                                    "port": port,
                                    "params": request.parameters,
                                    "token": request.token,
                                    "routing_key": request.routing_key,
                                }),
                            )
                        }
                    };

                    let bytes = JsonCodec.encode_response(&response).unwrap();
                    if write_frame(&mut stream, &bytes).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    TestServer {
        address: AddressModel::new("127.0.0.1", port),
        requests,
    }
}

/// An address nothing listens on.
pub async fn dead_address() -> AddressModel {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    AddressModel::new("127.0.0.1", port)
}

pub fn route(service_id: &str, addresses: impl IntoIterator<Item = AddressModel>) -> ServiceRoute {
    ServiceRoute::new(ServiceDescriptor::new(service_id, service_id.to_lowercase()), addresses)
}

pub struct Harness {
    pub table: Arc<RouteTable>,
    pub health: Arc<HealthTracker>,
    pub connections: Arc<ConnectionFactory>,
    pub invoker: Arc<ClusterInvoker>,
}

/// Invoker over `routes` where every service uses `command`.
pub fn harness(routes: Vec<ServiceRoute>, command: ServiceCommand) -> Harness {
    let table = Arc::new(RouteTable::new());
    table.set_routes(routes);
    let health = Arc::new(HealthTracker::default());
    let resolver = Arc::new(AddressResolver::new(
        Arc::clone(&table),
        Arc::clone(&health),
        Arc::new(NoopRefresher),
    ));
    let connections = Arc::new(ConnectionFactory::tcp(TcpChannelConfig {
        connect_timeout: Duration::from_millis(500),
        ..Default::default()
    }));
    let commands = Arc::new(ServiceCommandProvider::new(command));
    let invoker = Arc::new(ClusterInvoker::new(resolver, Arc::clone(&connections), commands));

    Harness {
        table,
        health,
        connections,
        invoker,
    }
}
