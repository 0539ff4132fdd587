//! Call instrumentation hooks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use meshrpc_common::{CorrelationId, InvokeResponse, RpcError};
use tracing::warn;

/// Identifies one transmission on a multiplexed connection.
#[derive(Debug, Clone, Copy)]
pub struct CallEvent<'a> {
    pub correlation_id: CorrelationId,
    pub service_id: &'a str,
    pub peer: &'a str,
}

/// Observer of multiplexer traffic. Every method defaults to a no-op.
///
/// Listeners run inline on the calling task and must not block. A panicking
/// listener is logged and otherwise ignored.
pub trait DiagnosticListener: Send + Sync {
    fn before_send(&self, _event: &CallEvent<'_>) {}

    fn after_receive(&self, _event: &CallEvent<'_>, _response: &InvokeResponse, _elapsed: Duration) {}

    fn on_error(&self, _event: &CallEvent<'_>, _error: &RpcError) {}
}

/// The set of registered listeners.
#[derive(Default)]
pub struct Diagnostics {
    listeners: ArcSwap<Vec<Arc<dyn DiagnosticListener>>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn DiagnosticListener>) {
        self.listeners.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&listener));
            next
        });
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.load().is_empty()
    }

    pub fn before_send(&self, event: &CallEvent<'_>) {
        self.emit("before_send", |l| l.before_send(event));
    }

    pub fn after_receive(&self, event: &CallEvent<'_>, response: &InvokeResponse, elapsed: Duration) {
        self.emit("after_receive", |l| l.after_receive(event, response, elapsed));
    }

    pub fn on_error(&self, event: &CallEvent<'_>, error: &RpcError) {
        self.emit("on_error", |l| l.on_error(event, error));
    }

    fn emit(&self, hook: &'static str, f: impl Fn(&dyn DiagnosticListener)) {
        let listeners = self.listeners.load();
        for listener in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                warn!(hook, "diagnostic listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("listeners", &self.listeners.load().len())
            .finish()
    }
}
