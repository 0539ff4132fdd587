use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meshrpc_common::protocol::error::Result;
use serde_json::Value;
use tracing::debug;

/// Produces a substitute result for a failed call.
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn invoke(&self, service_id: &str, parameters: &Value) -> Result<Value>;
}

/// Fallback handlers by name, as referenced by `fallback_name`.
#[derive(Default)]
pub struct FallbackRegistry {
    handlers: DashMap<String, Arc<dyn FallbackHandler>>,
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn FallbackHandler>) {
        let name = name.into();
        debug!(name = %name, "fallback handler registered");
        self.handlers.insert(name, handler);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FallbackHandler>> {
        self.handlers.get(name).map(|h| Arc::clone(h.value()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for FallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.handlers.iter().map(|h| h.key().clone()).collect();
        f.debug_struct("FallbackRegistry").field("handlers", &names).finish()
    }
}

/// Fallback that always answers with the same value.
#[derive(Debug, Clone)]
pub struct StaticFallback(pub Value);

#[async_trait]
impl FallbackHandler for StaticFallback {
    async fn invoke(&self, _service_id: &str, _parameters: &Value) -> Result<Value> {
        Ok(self.0.clone())
    }
}
