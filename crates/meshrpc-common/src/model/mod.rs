//! Service model shared by the routing and client layers.

pub mod address;
pub mod descriptor;
pub mod route;

pub use address::AddressModel;
pub use descriptor::{ServiceDescriptor, ServiceMetadata};
pub use route::ServiceRoute;
