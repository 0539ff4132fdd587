//! MeshRPC Common Types and Transport
//!
//! Shared vocabulary for every other MeshRPC crate:
//!
//! - **[`model`]**: service descriptors, endpoint addresses and routes
//! - **[`protocol`]**: invocation request/response messages and the [`RpcError`] taxonomy
//! - **[`transport`]**: the codec/channel contract and a framed TCP channel
//!
//! # Wire Format
//!
//! - **Transport**: TCP, one long-lived connection per endpoint
//! - **Serialization**: JSON
//! - **Message Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//! - **Max Message Size**: 100 MB
//!
//! # Example
//!
//! ```
//! use meshrpc_common::{InvokeRequest, InvokeResponse};
//! use serde_json::json;
//!
//! let request = InvokeRequest::new("Echo", json!({"text": "hi"}))
//!     .with_routing_key("user-42")
//!     .with_timeout(5000);
//!
//! let response = InvokeResponse::success(request.id, json!({"text": "hi"}));
//! assert!(response.is_success());
//! ```

pub mod model;
pub mod protocol;
pub mod transport;

pub use model::{AddressModel, ServiceDescriptor, ServiceMetadata, ServiceRoute};
pub use protocol::*;
