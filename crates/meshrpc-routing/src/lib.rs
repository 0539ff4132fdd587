//! MeshRPC Routing
//!
//! Everything needed to turn a service id into a live endpoint:
//!
//! - [`RouteTable`]: copy-on-write service id to route map with change events
//! - [`Selectors`]: round robin, rendezvous hash and random address selection
//! - [`HealthTracker`]: consecutive-failure tracking with exponential cool-down
//! - [`HealthChecker`]: optional periodic prober feeding the tracker
//! - [`AddressResolver`]: lookup, health filtering and selection

pub mod health;
pub mod health_checker;
pub mod resolver;
pub mod route_table;
pub mod selector;

pub use health::{HealthConfig, HealthRecord, HealthTracker};
pub use health_checker::{HealthCheckConfig, HealthCheckStatus, HealthChecker, HealthProbe};
pub use resolver::AddressResolver;
pub use route_table::{DiscoveryRefresher, NoopRefresher, RouteChange, RouteEvent, RouteTable};
pub use selector::{
    AddressSelector, HashSelector, PollingSelector, RandomSelector, SelectContext, SelectorMode,
    Selectors,
};
