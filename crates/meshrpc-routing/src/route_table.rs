//! Service routes and their change notifications.
//!
//! The table is a copy-on-write snapshot behind [`ArcSwap`]: lookups never
//! block, while writers are serialized and publish a complete replacement map
//! before announcing what changed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use meshrpc_common::{AddressModel, ServiceRoute};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the change notification channel. Slow subscribers observe
/// `RecvError::Lagged` rather than blocking writers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A registry notification about one service.
///
/// Fed into [`RouteTable::apply`] by discovery watchers, and emitted by the
/// table for every change that actually took effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEvent {
    Created(Arc<ServiceRoute>),
    Changed(Arc<ServiceRoute>),
    Removed(Arc<ServiceRoute>),
}

impl RouteEvent {
    pub fn route(&self) -> &Arc<ServiceRoute> {
        match self {
            RouteEvent::Created(route) | RouteEvent::Changed(route) | RouteEvent::Removed(route) => {
                route
            }
        }
    }

    pub fn service_id(&self) -> &str {
        self.route().service_id()
    }
}

/// An effective change published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteChange {
    pub event: RouteEvent,
    /// Addresses that no longer serve the service after this change.
    pub withdrawn: Vec<AddressModel>,
}

impl RouteChange {
    fn new(event: RouteEvent, previous: Option<&ServiceRoute>) -> Self {
        let withdrawn = match (&event, previous) {
            (RouteEvent::Removed(_), Some(previous)) => previous.addresses().to_vec(),
            (_, Some(previous)) => {
                let current: HashSet<&AddressModel> = event.route().addresses().iter().collect();
                previous
                    .addresses()
                    .iter()
                    .filter(|a| !current.contains(a))
                    .cloned()
                    .collect()
            }
            (_, None) => Vec::new(),
        };
        Self { event, withdrawn }
    }
}

/// Asks the discovery collaborator to refresh its view of a service.
///
/// The resolver calls this on a route miss and then looks the service up
/// again; implementations feed whatever they learn into the [`RouteTable`].
#[async_trait]
pub trait DiscoveryRefresher: Send + Sync {
    async fn refresh(&self, service_id: &str);
}

/// Refresher for statically configured tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRefresher;

#[async_trait]
impl DiscoveryRefresher for NoopRefresher {
    async fn refresh(&self, _service_id: &str) {}
}

type RouteMap = HashMap<String, Arc<ServiceRoute>>;

/// Mapping from service id to its current route.
pub struct RouteTable {
    routes: ArcSwap<RouteMap>,
    write_lock: Mutex<()>,
    events: broadcast::Sender<RouteChange>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            routes: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            events,
        }
    }

    pub fn get_route(&self, service_id: &str) -> Option<Arc<ServiceRoute>> {
        self.routes.load().get(service_id).cloned()
    }

    /// All active routes, ordered by service id.
    pub fn routes(&self) -> Vec<Arc<ServiceRoute>> {
        let mut routes: Vec<_> = self.routes.load().values().cloned().collect();
        routes.sort_by(|a, b| a.service_id().cmp(b.service_id()));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receives every change that takes effect from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RouteChange> {
        self.events.subscribe()
    }

    /// Replaces the whole table with a registry snapshot.
    ///
    /// Routes without addresses are treated as absent. Returns the changes,
    /// which have also been published to subscribers.
    pub fn set_routes(&self, routes: impl IntoIterator<Item = ServiceRoute>) -> Vec<RouteChange> {
        let _guard = self.lock_writers();
        let current = self.routes.load_full();

        let next: RouteMap = routes
            .into_iter()
            .filter(|route| route.is_active())
            .map(|route| (route.service_id().to_string(), Arc::new(route)))
            .collect();

        let mut changes = Vec::new();
        for (id, route) in &next {
            match current.get(id) {
                None => changes.push(RouteChange::new(RouteEvent::Created(Arc::clone(route)), None)),
                Some(previous) if previous != route => changes.push(RouteChange::new(
                    RouteEvent::Changed(Arc::clone(route)),
                    Some(previous),
                )),
                Some(_) => {}
            }
        }
        for (id, previous) in current.iter() {
            if !next.contains_key(id) {
                changes.push(RouteChange::new(
                    RouteEvent::Removed(Arc::clone(previous)),
                    Some(previous),
                ));
            }
        }

        self.routes.store(Arc::new(next));
        info!(routes = self.len(), changes = changes.len(), "route table replaced");
        self.publish(&changes);
        changes
    }

    /// Applies one incremental registry notification.
    ///
    /// `Created` and `Changed` both mean "this is the route now"; `Removed`
    /// withdraws the service. Duplicates and stale repeats are no-ops, so the
    /// call is idempotent. Returns the effective change, if any.
    pub fn apply(&self, event: RouteEvent) -> Option<RouteChange> {
        let _guard = self.lock_writers();
        let current = self.routes.load_full();
        let id = event.service_id().to_string();
        let previous = current.get(&id);

        let change = match event {
            RouteEvent::Created(route) | RouteEvent::Changed(route) if route.is_active() => {
                match previous {
                    Some(previous) if **previous == *route => None,
                    Some(previous) => Some(RouteChange::new(RouteEvent::Changed(route), Some(previous))),
                    None => Some(RouteChange::new(RouteEvent::Created(route), None)),
                }
            }
            // Removal, or an update that leaves nothing to route to.
            _ => previous.map(|previous| {
                RouteChange::new(RouteEvent::Removed(Arc::clone(previous)), Some(previous))
            }),
        };

        let change = change?;
        let mut next = RouteMap::clone(&current);
        match &change.event {
            RouteEvent::Removed(_) => {
                next.remove(&id);
            }
            RouteEvent::Created(route) | RouteEvent::Changed(route) => {
                next.insert(id.clone(), Arc::clone(route));
            }
        }
        self.routes.store(Arc::new(next));

        debug!(service_id = %id, event = ?change.event, "route updated");
        self.publish(std::slice::from_ref(&change));
        Some(change)
    }

    /// Scrubs the given addresses from every route.
    ///
    /// Routes left without addresses are withdrawn.
    pub fn remove_addresses(&self, addresses: &[AddressModel]) -> Vec<RouteChange> {
        if addresses.is_empty() {
            return Vec::new();
        }

        let _guard = self.lock_writers();
        let current = self.routes.load_full();
        let mut next = RouteMap::with_capacity(current.len());
        let mut changes = Vec::new();

        for (id, route) in current.iter() {
            if !route.addresses().iter().any(|a| addresses.contains(a)) {
                next.insert(id.clone(), Arc::clone(route));
                continue;
            }

            let scrubbed = Arc::new(route.without(addresses));
            if scrubbed.is_active() {
                changes.push(RouteChange::new(RouteEvent::Changed(Arc::clone(&scrubbed)), Some(route)));
                next.insert(id.clone(), scrubbed);
            } else {
                changes.push(RouteChange::new(RouteEvent::Removed(Arc::clone(route)), Some(route)));
            }
        }

        if changes.is_empty() {
            return changes;
        }

        self.routes.store(Arc::new(next));
        info!(addresses = addresses.len(), changes = changes.len(), "addresses removed from routes");
        self.publish(&changes);
        changes
    }

    fn publish(&self, changes: &[RouteChange]) {
        for change in changes {
            // No subscribers is not an error.
            let _ = self.events.send(change.clone());
        }
    }

    fn lock_writers(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
