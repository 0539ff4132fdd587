use thiserror::Error;

/// Errors surfaced by the MeshRPC invocation path.
///
/// Every variant carries owned text rather than a boxed source so the whole
/// enum is `Clone`. The circuit breaker depends on that: while broken it
/// replays the last real failure to every caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// No route, or a route without any usable address.
    #[error("Resolution error for service '{service_id}': {reason}")]
    Resolution { service_id: String, reason: String },

    /// Transport-level failure (connect refused, reset, send failure).
    #[error("Communication error with {address}: {message}")]
    Communication { address: String, message: String },

    /// The peer executed the call and reported an application failure.
    #[error("Remote error (status {status_code}): {message}")]
    Remote { status_code: i32, message: String },

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    /// The multiplexer was torn down while the call was pending.
    #[error("Connection to {0} closed")]
    ConnectionClosed(String),

    #[error("Invocation cancelled")]
    Cancelled,

    /// `max_concurrent_requests` reached for the service.
    #[error("Service '{service_id}' is overloaded ({limit} concurrent requests)")]
    Overloaded { service_id: String, limit: usize },

    /// Breaker forced open before any real failure was recorded.
    #[error("Circuit open for service '{0}'")]
    CircuitOpen(String),

    /// Recovery expression could not be evaluated.
    #[error("Injection error: {0}")]
    Injection(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RpcError {
    pub fn resolution(service_id: impl Into<String>, reason: impl Into<String>) -> Self {
        RpcError::Resolution {
            service_id: service_id.into(),
            reason: reason.into(),
        }
    }

    pub fn communication(address: impl ToString, message: impl Into<String>) -> Self {
        RpcError::Communication {
            address: address.to_string(),
            message: message.into(),
        }
    }

    pub fn remote(status_code: i32, message: impl Into<String>) -> Self {
        RpcError::Remote {
            status_code,
            message: message.into(),
        }
    }

    /// Communication-class failures: eligible for failover, health marking
    /// and circuit breaking. A timeout counts as one.
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            RpcError::Communication { .. } | RpcError::Timeout(_) | RpcError::ConnectionClosed(_)
        )
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, RpcError::Remote { .. })
    }

    /// Short label used in logs and in recovery expressions.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::Resolution { .. } => "resolution",
            RpcError::Communication { .. } => "communication",
            RpcError::Remote { .. } => "remote",
            RpcError::Timeout(_) => "timeout",
            RpcError::ConnectionClosed(_) => "connection_closed",
            RpcError::Cancelled => "cancelled",
            RpcError::Overloaded { .. } => "overloaded",
            RpcError::CircuitOpen(_) => "circuit_open",
            RpcError::Injection(_) => "injection",
            RpcError::Codec(_) => "codec",
            RpcError::Config(_) => "config",
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
