//! The `call` subcommand.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use meshrpc_client::{ClientConfig, MeshClient, RouteSettings};
use meshrpc_routing::NoopRefresher;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub service_id: String,
    /// Parameters as a JSON document.
    pub params: String,
    pub routing_key: Option<String>,
    pub timeout: Option<Duration>,
    /// Addresses that replace the configured route of the service.
    pub addresses: Vec<String>,
}

/// Invokes the service described by `options` and returns its result.
///
/// Ctrl-C cancels the call.
pub async fn run(mut config: ClientConfig, options: &CallOptions) -> Result<Value> {
    let params: Value = serde_json::from_str(&options.params)
        .map_err(|e| anyhow!("Invalid JSON in params: {}", e))?;

    if !options.addresses.is_empty() {
        config.routes.retain(|r| r.service_id != options.service_id);
        config.routes.push(RouteSettings {
            service_id: options.service_id.clone(),
            routing_path: String::new(),
            addresses: options.addresses.clone(),
            metadata: Default::default(),
        });
    }

    let client = MeshClient::start(&config, Arc::new(NoopRefresher), None)
        .context("Failed to start client")?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    debug!(service_id = %options.service_id, "invoking");
    let outcome = client
        .invoker()
        .invoke(
            &options.service_id,
            options.routing_key.as_deref(),
            params,
            options.timeout,
            &cancel,
        )
        .await;

    interrupt.abort();
    client.shutdown().await;

    outcome.with_context(|| format!("Call to '{}' failed", options.service_id))
}
