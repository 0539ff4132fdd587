//! MeshRPC Client
//!
//! The client-side invocation path: a [`ClusterInvoker`] resolves a service
//! id to an address, sends the request over a shared [`TransportClient`]
//! connection and applies the service's [`ServiceCommand`] when the call
//! fails.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshrpc_client::{ClientConfig, MeshClient};
//! use meshrpc_routing::NoopRefresher;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::load("meshrpc.toml")?;
//! let client = MeshClient::start(&config, Arc::new(NoopRefresher), None)?;
//!
//! let result = client.invoker().call("Echo", json!({"text": "hi"})).await?;
//! println!("{}", result);
//!
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod fallback;
pub mod injection;
pub mod invoker;
pub mod mesh;
pub mod multiplexer;

pub use command::{ServiceCommand, ServiceCommandProvider, StrategyType};
pub use config::{ClientConfig, HealthSettings, RouteSettings, TransportSettings};
pub use connection::{ConnectionFactory, Connector, TcpConnector};
pub use diagnostics::{CallEvent, DiagnosticListener, Diagnostics};
pub use fallback::{FallbackHandler, FallbackRegistry, StaticFallback};
pub use injection::{InjectionContext, InjectionEvaluator, ScriptEvaluator};
pub use invoker::ClusterInvoker;
pub use mesh::MeshClient;
pub use multiplexer::TransportClient;
