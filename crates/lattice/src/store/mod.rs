//! Store adapter contract and capability model
//!
//! Every physical backend (vector index, graph engine, tabular store,
//! triple store) is wrapped in an adapter implementing [`StoreAdapter`].
//! The router and synchronization manager depend only on this trait and
//! on the capability flags each store advertises; they never see concrete
//! backend types.

pub mod filter;

pub use filter::{QueryFilter, QueryFragment};

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AdapterError;
use crate::item::{ItemId, ItemType, MemoryItem};

/// Identifier of a configured backend store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreId(pub String);

impl StoreId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StoreId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A declared ability of a backend store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    VectorSearch,
    GraphTraversal,
    StructuredQuery,
    TripleQuery,
}

/// Set of capability flags advertised by a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self(capabilities.into_iter().collect())
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0.insert(capability);
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Configured description of a backend store.
///
/// Supplied at startup by the external configuration loader. `priority`
/// breaks ranking ties and orders cascading queries; lower is better.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub store_id: StoreId,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    #[serde(default)]
    pub priority: u32,
}

/// An item scored by a store in its native scale.
///
/// Native scales are incomparable across stores (cosine similarity,
/// graph-path length, SQL relevance); the router normalizes them before
/// merging.
#[derive(Debug, Clone)]
pub struct ScoredItem {
    pub item: MemoryItem,
    pub score: f64,
}

impl ScoredItem {
    pub fn new(item: MemoryItem, score: f64) -> Self {
        Self { item, score }
    }
}

/// Uniform contract over one physical backend.
///
/// Contract requirements:
/// - `put` is idempotent for a given `(id, version)` pair; replays must
///   not corrupt state.
/// - `query` never fails on "not found"; it returns an empty vec.
/// - Transient outages are reported as [`AdapterError::Unavailable`],
///   distinct from [`AdapterError::Conflict`].
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    fn store_id(&self) -> &StoreId;

    fn capabilities(&self) -> CapabilitySet;

    async fn put(&self, item: &MemoryItem) -> Result<(), AdapterError>;

    async fn get(&self, id: &ItemId) -> Result<Option<MemoryItem>, AdapterError>;

    async fn delete(&self, id: &ItemId) -> Result<(), AdapterError>;

    async fn query(&self, fragment: &QueryFragment) -> Result<Vec<ScoredItem>, AdapterError>;
}

/// A registered adapter bound to its configured descriptor.
#[derive(Clone)]
pub struct RegisteredStore {
    pub store_id: StoreId,
    pub priority: u32,
    pub capabilities: CapabilitySet,
    pub adapter: Arc<dyn StoreAdapter>,
}

impl fmt::Debug for RegisteredStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredStore")
            .field("store_id", &self.store_id)
            .field("priority", &self.priority)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

const UNCONFIGURED_PRIORITY: u32 = 100;

/// The set of registered stores, ordered by priority.
///
/// Built once at startup from the configured descriptors and the adapter
/// instances; answers capability-eligibility questions for both query
/// routing and write propagation.
pub struct StoreSet {
    stores: Vec<RegisteredStore>,
}

impl StoreSet {
    /// Bind adapters to their configured descriptors.
    ///
    /// Capabilities are taken from the adapter itself (the adapter knows
    /// what it can do); the descriptor contributes the priority. Adapters
    /// without a descriptor get a default low priority.
    pub fn new(descriptors: &[StoreDescriptor], adapters: Vec<Arc<dyn StoreAdapter>>) -> Self {
        let mut stores: Vec<RegisteredStore> = adapters
            .into_iter()
            .map(|adapter| {
                let store_id = adapter.store_id().clone();
                let priority = match descriptors.iter().find(|d| d.store_id == store_id) {
                    Some(descriptor) => descriptor.priority,
                    None => {
                        warn!(store = %store_id, "No descriptor configured for store, using default priority");
                        UNCONFIGURED_PRIORITY
                    }
                };
                RegisteredStore {
                    capabilities: adapter.capabilities(),
                    store_id,
                    priority,
                    adapter,
                }
            })
            .collect();
        stores.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.store_id.cmp(&b.store_id)));

        for descriptor in descriptors {
            if !stores.iter().any(|s| s.store_id == descriptor.store_id) {
                warn!(store = %descriptor.store_id, "Descriptor configured but no adapter registered");
            }
        }

        Self { stores }
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn contains(&self, id: &StoreId) -> bool {
        self.stores.iter().any(|s| &s.store_id == id)
    }

    pub fn get(&self, id: &StoreId) -> Option<&RegisteredStore> {
        self.stores.iter().find(|s| &s.store_id == id)
    }

    pub fn adapter(&self, id: &StoreId) -> Option<Arc<dyn StoreAdapter>> {
        self.get(id).map(|s| Arc::clone(&s.adapter))
    }

    pub fn priority(&self, id: &StoreId) -> Option<u32> {
        self.get(id).map(|s| s.priority)
    }

    /// All stores in priority order (most preferred first).
    pub fn by_priority(&self) -> impl Iterator<Item = &RegisteredStore> {
        self.stores.iter()
    }

    /// Stores eligible to serve a query fragment.
    ///
    /// Embedding queries need vector search, traversal queries need graph
    /// support; everything else is served by structured or triple stores.
    pub fn eligible_for_query(&self, fragment: &QueryFragment) -> Vec<RegisteredStore> {
        self.stores
            .iter()
            .filter(|s| {
                if fragment.filter.embedding.is_some() {
                    s.capabilities.contains(Capability::VectorSearch)
                } else if fragment.graph_depth.is_some() {
                    s.capabilities.contains(Capability::GraphTraversal)
                } else {
                    s.capabilities.contains(Capability::StructuredQuery)
                        || s.capabilities.contains(Capability::TripleQuery)
                }
            })
            .cloned()
            .collect()
    }

    /// Store ids eligible to hold a copy of an item, in priority order.
    ///
    /// Structured stores hold every item; vector stores hold items that
    /// carry an embedding; graph and triple stores hold structural and
    /// relationship items.
    pub fn eligible_for_item(&self, item: &MemoryItem) -> Vec<StoreId> {
        self.stores
            .iter()
            .filter(|s| {
                s.capabilities.contains(Capability::StructuredQuery)
                    || (item.payload.embedding.is_some()
                        && s.capabilities.contains(Capability::VectorSearch))
                    || (matches!(item.item_type, ItemType::Relationship | ItemType::Structural)
                        && (s.capabilities.contains(Capability::GraphTraversal)
                            || s.capabilities.contains(Capability::TripleQuery)))
            })
            .map(|s| s.store_id.clone())
            .collect()
    }
}
