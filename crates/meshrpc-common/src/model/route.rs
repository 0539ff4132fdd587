use serde::{Deserialize, Serialize};

use super::{AddressModel, ServiceDescriptor};

/// A service descriptor together with the addresses currently serving it.
///
/// Addresses are kept sorted and de-duplicated, so derived equality is
/// structural equality of descriptor plus address *set*. A route with no
/// addresses is withdrawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRoute {
    pub descriptor: ServiceDescriptor,
    addresses: Vec<AddressModel>,
}

impl ServiceRoute {
    pub fn new(descriptor: ServiceDescriptor, addresses: impl IntoIterator<Item = AddressModel>) -> Self {
        let mut addresses: Vec<AddressModel> = addresses.into_iter().collect();
        addresses.sort();
        addresses.dedup();
        Self {
            descriptor,
            addresses,
        }
    }

    pub fn service_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn addresses(&self) -> &[AddressModel] {
        &self.addresses
    }

    pub fn is_active(&self) -> bool {
        !self.addresses.is_empty()
    }

    /// Returns a copy of this route without the given addresses.
    pub fn without(&self, removed: &[AddressModel]) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            addresses: self
                .addresses
                .iter()
                .filter(|a| !removed.contains(a))
                .cloned()
                .collect(),
        }
    }
}
