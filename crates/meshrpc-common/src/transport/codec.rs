use crate::protocol::error::Result;
use crate::protocol::{InvokeRequest, InvokeResponse};

/// Converts invocation messages to and from bytes.
///
/// The multiplexer only depends on this contract; framing is the channel's
/// business and protocol-specific codecs live outside this crate.
pub trait MessageCodec: Send + Sync {
    fn encode_request(&self, request: &InvokeRequest) -> Result<Vec<u8>>;

    fn decode_request(&self, data: &[u8]) -> Result<InvokeRequest>;

    fn encode_response(&self, response: &InvokeResponse) -> Result<Vec<u8>>;

    fn decode_response(&self, data: &[u8]) -> Result<InvokeResponse>;
}

/// JSON codec for invocation messages
///
/// Uses JSON so `serde_json::Value` parameters and results pass through
/// without a schema.
///
/// # Example
///
/// ```
/// use meshrpc_common::transport::{JsonCodec, MessageCodec};
/// use meshrpc_common::protocol::InvokeResponse;
/// use serde_json::json;
///
/// let codec = JsonCodec;
/// let response = InvokeResponse::success(123, json!({"result": "ok"}));
/// let encoded = codec.encode_response(&response).unwrap();
/// let decoded = codec.decode_response(&encoded).unwrap();
/// assert_eq!(decoded.id, 123);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode_request(&self, request: &InvokeRequest) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    fn decode_request(&self, data: &[u8]) -> Result<InvokeRequest> {
        Ok(serde_json::from_slice(data)?)
    }

    fn encode_response(&self, response: &InvokeResponse) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    fn decode_response(&self, data: &[u8]) -> Result<InvokeResponse> {
        Ok(serde_json::from_slice(data)?)
    }
}
