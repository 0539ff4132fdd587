//! MeshRPC Response Types
//!
//! A response is matched to its request by correlation id. Success and
//! failure are told apart by the explicit `error` field of the payload, never
//! by wire-level framing.

use serde::{Deserialize, Serialize};

use super::error::RpcError;
use super::CorrelationId;

/// Invocation result (JSON value).
pub type InvokeResult = serde_json::Value;

/// Application-level failure reported by the remote peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteFault {
    pub message: String,
    pub status_code: i32,
}

/// A response delivered by the channel's inbound listener.
///
/// # Example
///
/// ```
/// use meshrpc_common::protocol::InvokeResponse;
/// use serde_json::json;
///
/// let ok = InvokeResponse::success(7, json!({"echo": "hi"}));
/// assert!(ok.is_success());
///
/// let failed = InvokeResponse::failure(7, 500, "Division by zero");
/// assert!(!failed.is_success());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvokeResponse {
    /// Correlation id of the request this answers
    pub id: CorrelationId,
    /// Result value (present on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<InvokeResult>,
    /// Failure reported by the peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFault>,
}

impl InvokeResponse {
    pub fn success(id: CorrelationId, result: InvokeResult) -> Self {
        InvokeResponse {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: CorrelationId, status_code: i32, message: impl Into<String>) -> Self {
        InvokeResponse {
            id,
            result: None,
            error: Some(RemoteFault {
                message: message.into(),
                status_code,
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Converts the payload into the caller-facing outcome.
    ///
    /// A success without a result body maps to JSON `null`.
    pub fn into_result(self) -> Result<InvokeResult, RpcError> {
        match self.error {
            Some(fault) => Err(RpcError::remote(fault.status_code, fault.message)),
            None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}
