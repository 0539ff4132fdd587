//! Address selection strategies.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use meshrpc_common::AddressModel;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Which selector a service uses (`shunt_strategy` in command settings).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SelectorMode {
    /// Round robin per service.
    #[default]
    Polling,
    /// Stable mapping from routing key to address.
    HashAlgorithm,
    Random,
}

/// Inputs for one selection.
#[derive(Debug, Clone, Copy)]
pub struct SelectContext<'a> {
    pub service_id: &'a str,
    pub routing_key: Option<&'a str>,
    /// Never empty when handed over by the resolver.
    pub candidates: &'a [AddressModel],
}

/// Picks one address out of a candidate set.
pub trait AddressSelector: Send + Sync {
    fn select(&self, ctx: &SelectContext<'_>) -> Option<AddressModel>;
}

/// Round-robin selector.
///
/// Each service has its own cursor, so a busy service does not skew the
/// rotation seen by another one.
#[derive(Debug, Default)]
pub struct PollingSelector {
    cursors: DashMap<String, AtomicUsize>,
}

impl PollingSelector {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_index(&self, service_id: &str, len: usize) -> usize {
        if let Some(cursor) = self.cursors.get(service_id) {
            return cursor.fetch_add(1, Ordering::Relaxed) % len;
        }
        let cursor = self
            .cursors
            .entry(service_id.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        cursor.fetch_add(1, Ordering::Relaxed) % len
    }
}

impl AddressSelector for PollingSelector {
    fn select(&self, ctx: &SelectContext<'_>) -> Option<AddressModel> {
        if ctx.candidates.is_empty() {
            return None;
        }
        let index = self.next_index(ctx.service_id, ctx.candidates.len());
        ctx.candidates.get(index).cloned()
    }
}

/// Rendezvous (highest random weight) hashing over FNV-1a.
///
/// The same key and candidate set always yield the same address, and removing
/// an address only remaps the keys that were on it. Calls without a routing
/// key fall back to round robin.
#[derive(Debug, Default)]
pub struct HashSelector {
    fallback: PollingSelector,
}

impl HashSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AddressSelector for HashSelector {
    fn select(&self, ctx: &SelectContext<'_>) -> Option<AddressModel> {
        let Some(key) = ctx.routing_key else {
            return self.fallback.select(ctx);
        };
        ctx.candidates
            .iter()
            .max_by_key(|address| rendezvous_score(key, address))
            .cloned()
    }
}

/// Uniformly random selector.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl AddressSelector for RandomSelector {
    fn select(&self, ctx: &SelectContext<'_>) -> Option<AddressModel> {
        if ctx.candidates.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..ctx.candidates.len());
        ctx.candidates.get(index).cloned()
    }
}

/// One instance of every built-in selector, shared by all services.
#[derive(Debug, Default)]
pub struct Selectors {
    polling: PollingSelector,
    hash: HashSelector,
    random: RandomSelector,
}

impl Selectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_mode(&self, mode: SelectorMode) -> &dyn AddressSelector {
        match mode {
            SelectorMode::Polling => &self.polling,
            SelectorMode::HashAlgorithm => &self.hash,
            SelectorMode::Random => &self.random,
        }
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(state: u64, bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(state, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME))
}

/// Score of `address` for `key`; ties are broken by address order via
/// `max_by_key` keeping the last maximum, which is deterministic for a sorted
/// candidate list.
fn rendezvous_score(key: &str, address: &AddressModel) -> u64 {
    let hash = fnv1a(FNV_OFFSET_BASIS, key.as_bytes());
    let hash = fnv1a(hash, &[0xff]);
    let hash = fnv1a(hash, address.host.as_bytes());
    fnv1a(hash, &address.port.to_be_bytes())
}
