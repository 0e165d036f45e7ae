//! Memory manager facade
//!
//! The single entry point the orchestration layer calls. Composes the
//! registry, query router and synchronization manager over the registered
//! store adapters. Writes persist synchronously to the home store and
//! converge to the remaining stores asynchronously.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::MemoryConfig;
use crate::error::{ManagerError, Result};
use crate::item::{ItemId, ItemType, MemoryItem, Payload};
use crate::registry::{MemoryItemRegistry, RegistrySnapshot};
use crate::router::{QueryRequest, QueryRouter, RankedItem};
use crate::store::{Capability, StoreAdapter, StoreId, StoreSet};
use crate::sync::{OperationId, SyncManager, SyncRecord, SyncStats};

/// Unified facade over the hybrid memory fabric.
pub struct MemoryManager {
    stores: Arc<StoreSet>,
    registry: Arc<MemoryItemRegistry>,
    router: QueryRouter,
    sync: SyncManager,
    home_store: StoreId,
}

impl MemoryManager {
    /// Build a manager from configuration and adapter instances.
    ///
    /// Must be called from within a tokio runtime; the synchronization
    /// worker pool is spawned here.
    pub fn new(config: MemoryConfig, adapters: Vec<Arc<dyn StoreAdapter>>) -> Result<Self> {
        Self::build(config, adapters, MemoryItemRegistry::new())
    }

    /// Restore a manager over a previously persisted registry snapshot.
    pub fn with_registry_snapshot(
        config: MemoryConfig,
        adapters: Vec<Arc<dyn StoreAdapter>>,
        snapshot: RegistrySnapshot,
    ) -> Result<Self> {
        Self::build(config, adapters, MemoryItemRegistry::from_snapshot(snapshot))
    }

    fn build(
        config: MemoryConfig,
        adapters: Vec<Arc<dyn StoreAdapter>>,
        registry: MemoryItemRegistry,
    ) -> Result<Self> {
        let stores = Arc::new(StoreSet::new(&config.stores, adapters));

        let home_store = match &config.home_store {
            Some(id) => {
                if !stores.contains(id) {
                    return Err(ManagerError::Config(format!(
                        "configured home store {id} has no registered adapter"
                    )));
                }
                id.clone()
            }
            None => elect_home_store(&stores).ok_or_else(|| {
                ManagerError::Config("at least one store adapter is required".to_string())
            })?,
        };

        let registry = Arc::new(registry);
        let router = QueryRouter::new(Arc::clone(&stores), Arc::clone(&registry), config.query);
        let sync = SyncManager::new(Arc::clone(&stores), Arc::clone(&registry), config.sync);

        info!(
            stores = stores.len(),
            home = %home_store,
            "Memory manager initialized"
        );
        Ok(Self {
            stores,
            registry,
            router,
            sync,
            home_store,
        })
    }

    /// Store that receives writes synchronously.
    pub fn home_store(&self) -> &StoreId {
        &self.home_store
    }

    /// Accept a write: assign identity and version, persist to the home
    /// store, and enqueue propagation to every other capable store.
    ///
    /// Returns once the home store holds the item; convergence to the
    /// remaining stores is asynchronous.
    pub async fn write(&self, item: MemoryItem) -> Result<MemoryItem> {
        let mut item = item;
        if item.id.is_empty() {
            item.id = ItemId::generate();
        }

        let guard = self.registry.write_lock(&item.id).await;
        let written = self.commit_write(item).await?;
        drop(guard);
        Ok(written)
    }

    /// Tag-and-write convenience for phase-scoped reasoning output.
    pub async fn write_with_phase(
        &self,
        item: MemoryItem,
        phase: impl Into<String>,
    ) -> Result<MemoryItem> {
        self.write(item.with_phase(phase)).await
    }

    /// Write path body; the caller holds the item's write shard.
    async fn commit_write(&self, mut item: MemoryItem) -> Result<MemoryItem> {
        item.version = self.registry.next_version(&item.id);
        let now = Utc::now();
        item.created_at = self.registry.created_at(&item.id).unwrap_or(now);
        item.updated_at = now;
        item.owning_stores.clear();

        if item.is_tombstone() {
            self.registry.mark_tombstoned(&item.id);
        } else if self.registry.is_tombstoned(&item.id) {
            // An explicit new write to a deleted id revives it; the higher
            // version propagates cleanly past any remaining tombstones.
            self.registry.clear_tombstone(&item.id);
        }

        let home = self.stores.adapter(&self.home_store).ok_or_else(|| {
            ManagerError::Config(format!("home store {} missing", self.home_store))
        })?;
        home.put(&item).await?;

        self.registry.record_owner(&item.id, &self.home_store);
        item.owning_stores.insert(self.home_store.clone());
        if item.is_tombstone() {
            self.registry.confirm_tombstone(&item.id, &self.home_store);
        }

        let record = self.sync.propagate(&item, &self.home_store);
        self.router.invalidate_cache();
        debug!(
            item_id = %item.id,
            version = item.version,
            operation_id = %record.operation_id,
            "Write accepted"
        );
        Ok(item)
    }

    /// Direct lookup by id via the registry and the home store, falling
    /// back to any other owning store. Logically deleted items read as
    /// absent even while their tombstone is still propagating.
    pub async fn read(&self, id: &ItemId) -> Result<Option<MemoryItem>> {
        if self.registry.is_tombstoned(id) {
            return Ok(None);
        }

        let mut lookup_order = vec![self.home_store.clone()];
        for owner in self.registry.owners(id) {
            if owner != self.home_store {
                lookup_order.push(owner);
            }
        }

        for store_id in lookup_order {
            let Some(adapter) = self.stores.adapter(&store_id) else {
                continue;
            };
            match adapter.get(id).await {
                Ok(Some(item)) if !item.is_tombstone() => return Ok(Some(item)),
                Ok(_) => {}
                Err(err) => {
                    warn!(item_id = %id, store = %store_id, error = %err, "Read fell through to next owning store");
                }
            }
        }
        Ok(None)
    }

    /// Execute a routed query.
    pub async fn query(&self, request: &QueryRequest) -> Result<Vec<RankedItem>> {
        Ok(self.router.execute(request).await?)
    }

    /// Logically delete an item by writing and propagating its tombstone.
    ///
    /// The registry keeps tracking the id until every owning store has
    /// confirmed the tombstone.
    pub async fn delete(&self, id: &ItemId) -> Result<()> {
        if !self.registry.contains(id) {
            return Err(ManagerError::NotFound(id.to_string()));
        }

        let guard = self.registry.write_lock(id).await;

        // Base the tombstone on the current copy so type and metadata
        // survive into the deletion marker.
        let basis = match self.stores.adapter(&self.home_store) {
            Some(home) => home.get(id).await.ok().flatten(),
            None => None,
        };
        let tombstone = match basis {
            Some(existing) => existing.into_tombstone(),
            None => {
                MemoryItem::new(id.clone(), ItemType::Semantic, Payload::text("")).into_tombstone()
            }
        };

        self.commit_write(tombstone).await?;
        drop(guard);
        Ok(())
    }

    /// Wait for all enqueued propagation work to drain. Primarily for
    /// tests and orderly shutdown.
    pub async fn wait_for_sync(&self) {
        self.sync.quiesce().await;
    }

    /// State of one sync transaction.
    pub fn sync_status(&self, operation_id: &OperationId) -> Option<SyncRecord> {
        self.sync.status(operation_id)
    }

    /// All sync records touching an item.
    pub fn sync_records_for(&self, id: &ItemId) -> Vec<SyncRecord> {
        self.sync.records_for(id)
    }

    /// Synchronization counters.
    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats()
    }

    /// Re-run conflict resolution for an item held in `Conflict`.
    pub async fn resolve_conflict(&self, id: &ItemId) -> Result<MemoryItem> {
        Ok(self.sync.resolve_conflict(id).await?)
    }

    /// Whether an item has a conflict awaiting explicit resolution.
    pub fn has_pending_conflict(&self, id: &ItemId) -> bool {
        self.sync.has_pending_conflict(id)
    }

    /// Durable snapshot of the registry.
    pub fn registry_snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    /// Read-only access to the registry for inspection.
    pub fn registry(&self) -> &MemoryItemRegistry {
        &self.registry
    }
}

/// Default home store: the most preferred structured store (it accepts
/// every item type), else the most preferred store overall.
fn elect_home_store(stores: &StoreSet) -> Option<StoreId> {
    stores
        .by_priority()
        .find(|s| s.capabilities.contains(Capability::StructuredQuery))
        .or_else(|| stores.by_priority().next())
        .map(|s| s.store_id.clone())
}
