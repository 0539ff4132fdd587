use serde::{Deserialize, Serialize};

/// Tag linking a request to its response on a shared connection.
pub type CorrelationId = u64;
pub type ServiceId = String;
pub type InvokeParameters = serde_json::Value;

/// A remote invocation as it travels over the wire.
///
/// The correlation id is left at zero by [`InvokeRequest::new`]; the
/// connection multiplexer stamps a fresh id right before transmission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvokeRequest {
    pub id: CorrelationId,
    pub service_id: ServiceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
    pub parameters: InvokeParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Descriptor token, attached when the service requires authorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl InvokeRequest {
    pub fn new(service_id: impl Into<String>, parameters: InvokeParameters) -> Self {
        InvokeRequest {
            id: 0,
            service_id: service_id.into(),
            routing_key: None,
            parameters,
            timeout_ms: None,
            token: None,
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}
