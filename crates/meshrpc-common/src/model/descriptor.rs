use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Metadata flags published alongside a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetadata {
    /// Callers must present `token` with every request.
    #[serde(default)]
    pub enable_authorization: bool,
    /// The service is only reachable in-process and must not be invoked remotely.
    #[serde(default)]
    pub disable_network: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Free-form registry metadata carried through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Identifies a remotely callable service.
///
/// Descriptors are immutable once published; an update from the registry
/// replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: String,
    pub routing_path: String,
    #[serde(default)]
    pub metadata: ServiceMetadata,
}

impl ServiceDescriptor {
    pub fn new(id: impl Into<String>, routing_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            routing_path: routing_path.into(),
            metadata: ServiceMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: ServiceMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Token to attach to outgoing requests, if authorization is required.
    pub fn authorization_token(&self) -> Option<&str> {
        if self.metadata.enable_authorization {
            self.metadata.token.as_deref()
        } else {
            None
        }
    }
}
