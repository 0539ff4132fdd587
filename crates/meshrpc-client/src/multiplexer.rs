//! Request/response correlation over one shared connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use meshrpc_common::protocol::error::{Result, RpcError};
use meshrpc_common::transport::{InboundHandler, MessageSender};
use meshrpc_common::{AddressModel, CorrelationId, InvokeRequest, InvokeResponse};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::diagnostics::{CallEvent, Diagnostics};

/// A call waiting for its response.
struct PendingInvocation {
    tx: oneshot::Sender<Result<InvokeResponse>>,
    service_id: String,
}

/// Multiplexes concurrent invocations over one connection to one endpoint.
///
/// Every outgoing request gets a fresh correlation id and a pending entry.
/// Whoever removes the entry first (the inbound listener delivering a
/// response, disposal, or the caller giving up) owns its completion, so every
/// call resolves exactly once and late responses are dropped.
pub struct TransportClient {
    peer: AddressModel,
    peer_label: String,
    sender: Arc<dyn MessageSender>,
    pending: DashMap<CorrelationId, PendingInvocation>,
    next_id: AtomicU64,
    closed: AtomicBool,
    diagnostics: Arc<Diagnostics>,
}

impl TransportClient {
    pub fn new(peer: AddressModel, sender: Arc<dyn MessageSender>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            peer_label: peer.to_string(),
            peer,
            sender,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            diagnostics,
        }
    }

    pub fn peer(&self) -> &AddressModel {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Sends `request` and waits up to `timeout` for its response.
    ///
    /// The request's id is overwritten with a fresh correlation id. A remote
    /// failure is returned as an `Ok` response carrying an error; only
    /// transport problems (send failure, timeout, disposal) are `Err`.
    pub async fn send(&self, mut request: InvokeRequest, timeout: Duration) -> Result<InvokeResponse> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed(self.peer_label.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        request.id = id;
        if request.timeout_ms.is_none() {
            request.timeout_ms = Some(timeout.as_millis() as u64);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingInvocation {
                tx,
                service_id: request.service_id.clone(),
            },
        );
        let _guard = PendingGuard { client: self, id };

        // Disposal may have drained the map between the check above and the
        // insert; the entry would otherwise wait for its timeout.
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed(self.peer_label.clone()));
        }

        let event = CallEvent {
            correlation_id: id,
            service_id: &request.service_id,
            peer: &self.peer_label,
        };
        let started = Instant::now();
        self.diagnostics.before_send(&event);

        // Transmission and the wait for the response share one deadline; a
        // stalled write must not outlive it.
        let exchange = async {
            if let Err(error) = self.sender.send(&request).await {
                return Err(error);
            }
            trace!(peer = %self.peer_label, correlation_id = id, "request sent");
            match rx.await {
                Ok(outcome) => outcome,
                // The entry was removed without completion.
                Err(_) => Err(RpcError::ConnectionClosed(self.peer_label.clone())),
            }
        };
        let outcome = match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Timeout(timeout.as_millis() as u64)),
        };

        match &outcome {
            Ok(response) => self.diagnostics.after_receive(&event, response, started.elapsed()),
            Err(error) => self.diagnostics.on_error(&event, error),
        }
        outcome
    }

    /// Completes the pending call matching `response.id`.
    ///
    /// Returns `false` when no call is waiting for it (unknown id, or the
    /// caller already timed out or was cancelled).
    pub fn deliver(&self, response: InvokeResponse) -> bool {
        match self.pending.remove(&response.id) {
            Some((_, pending)) => {
                // The receiver may have been dropped in the meantime.
                let _ = pending.tx.send(Ok(response));
                true
            }
            None => {
                debug!(peer = %self.peer_label, correlation_id = response.id, "dropping response without pending call");
                false
            }
        }
    }

    /// Disposes the client: pending calls fail with `ConnectionClosed`,
    /// later sends fail fast, and the channel is shut down.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fail_pending(RpcError::ConnectionClosed(self.peer_label.clone()));
        self.sender.close().await;
        debug!(peer = %self.peer_label, "transport client closed");
    }

    fn fail_pending(&self, reason: RpcError) {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0usize;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                trace!(correlation_id = id, service_id = %pending.service_id, "failing pending call");
                let _ = pending.tx.send(Err(reason.clone()));
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(peer = %self.peer_label, failed, reason = %reason, "pending calls failed on disposal");
        }
    }
}

impl InboundHandler for TransportClient {
    fn on_response(&self, response: InvokeResponse) {
        self.deliver(response);
    }

    fn on_closed(&self, reason: RpcError) {
        self.closed.store(true, Ordering::Release);
        debug!(peer = %self.peer_label, reason = %reason, "channel closed by peer");
        self.fail_pending(reason);
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("peer", &self.peer_label)
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Removes the pending entry when the caller stops waiting, whatever the
/// reason (completion, timeout, error or a dropped future).
struct PendingGuard<'a> {
    client: &'a TransportClient,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.client.pending.remove(&self.id);
    }
}
