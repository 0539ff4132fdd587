use async_trait::async_trait;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::{InvokeRequest, InvokeResponse};

/// Outbound half of a logical connection to one endpoint.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Transmits an already-tagged request.
    async fn send(&self, request: &InvokeRequest) -> Result<()>;

    /// Shuts the outbound half down. Idempotent.
    async fn close(&self);
}

/// Receiver of out-of-band traffic from a channel's inbound listener.
pub trait InboundHandler: Send + Sync {
    fn on_response(&self, response: InvokeResponse);

    /// The channel is gone; `reason` describes why.
    fn on_closed(&self, reason: RpcError);
}
