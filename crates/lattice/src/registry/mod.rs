//! Memory item registry
//!
//! Authoritative mapping from item id to version metadata, owning-store
//! set and tombstone state. Entries live in a hash-sharded concurrent map
//! so unrelated items never contend; a fixed arena of async mutexes
//! serializes the write path per item without any global lock.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::item::ItemId;
use crate::store::StoreId;

/// Number of write shards in the lock arena.
///
/// Writes to the same item always hash to the same shard, so per-item
/// ordering holds; collisions between unrelated items only cost brief
/// serialization of their write paths.
const WRITE_SHARDS: usize = 64;

#[derive(Debug, Clone)]
struct RegistryEntry {
    version: u64,
    owning_stores: BTreeSet<StoreId>,
    tombstoned: bool,
    tombstone_confirms: BTreeSet<StoreId>,
    created_at: DateTime<Utc>,
}

impl RegistryEntry {
    fn new() -> Self {
        Self {
            version: 0,
            owning_stores: BTreeSet::new(),
            tombstoned: false,
            tombstone_confirms: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }
}

/// Authoritative index of item identity and version metadata.
///
/// The facade is the sole writer of record, so `next_version` is a plain
/// atomic increment under the entry's shard lock - no distributed
/// coordination is involved.
pub struct MemoryItemRegistry {
    entries: DashMap<ItemId, RegistryEntry>,
    write_shards: Vec<Mutex<()>>,
}

impl MemoryItemRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            write_shards: (0..WRITE_SHARDS).map(|_| Mutex::new(())).collect(),
        }
    }

    fn shard_index(&self, id: &ItemId) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() as usize) % self.write_shards.len()
    }

    /// Acquire the write shard for an item.
    ///
    /// Held across the home-store persist and propagation enqueue so that
    /// writes to the same id reach the home store and the sync queue in
    /// call order. Never held across query-path adapter calls.
    pub async fn write_lock(&self, id: &ItemId) -> MutexGuard<'_, ()> {
        self.write_shards[self.shard_index(id)].lock().await
    }

    /// Allocate the next version for an item, creating its entry on first
    /// use. Strictly increasing per id.
    pub fn next_version(&self, id: &ItemId) -> u64 {
        let mut entry = self
            .entries
            .entry(id.clone())
            .or_insert_with(RegistryEntry::new);
        entry.version += 1;
        entry.version
    }

    pub fn version(&self, id: &ItemId) -> Option<u64> {
        self.entries.get(id).map(|e| e.version)
    }

    pub fn created_at(&self, id: &ItemId) -> Option<DateTime<Utc>> {
        self.entries.get(id).map(|e| e.created_at)
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record that a store holds a copy of the item.
    pub fn record_owner(&self, id: &ItemId, store: &StoreId) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.owning_stores.insert(store.clone());
        }
    }

    /// Stores believed to currently hold a copy of the item.
    pub fn owners(&self, id: &ItemId) -> BTreeSet<StoreId> {
        self.entries
            .get(id)
            .map(|e| e.owning_stores.clone())
            .unwrap_or_default()
    }

    pub fn is_tombstoned(&self, id: &ItemId) -> bool {
        self.entries.get(id).map(|e| e.tombstoned).unwrap_or(false)
    }

    pub fn mark_tombstoned(&self, id: &ItemId) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.tombstoned = true;
        }
    }

    /// Clear tombstone state on an explicit new write to a deleted id.
    pub fn clear_tombstone(&self, id: &ItemId) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.tombstoned = false;
            entry.tombstone_confirms.clear();
        }
    }

    /// Record that a store has applied the item's tombstone.
    ///
    /// Once every owning store has confirmed, the entry is pruned and
    /// `true` is returned.
    pub fn confirm_tombstone(&self, id: &ItemId, store: &StoreId) -> bool {
        let prune = {
            let mut entry = match self.entries.get_mut(id) {
                Some(entry) => entry,
                None => return false,
            };
            if !entry.tombstoned {
                return false;
            }
            entry.owning_stores.insert(store.clone());
            entry.tombstone_confirms.insert(store.clone());
            entry
                .owning_stores
                .iter()
                .all(|owner| entry.tombstone_confirms.contains(owner))
        };
        if prune {
            self.entries.remove(id);
            debug!(item_id = %id, "Pruned registry entry after full tombstone confirmation");
        }
        prune
    }

    /// Durable snapshot of the registry.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let entries = self
            .entries
            .iter()
            .map(|entry| {
                (
                    entry.key().as_str().to_string(),
                    SnapshotEntry {
                        version: entry.version,
                        owning_stores: entry.owning_stores.clone(),
                        tombstoned: entry.tombstoned,
                        created_at: entry.created_at,
                    },
                )
            })
            .collect();
        RegistrySnapshot { entries }
    }

    /// Rebuild a registry from a snapshot.
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let registry = Self::new();
        for (id, entry) in snapshot.entries {
            registry.entries.insert(
                ItemId::new(id),
                RegistryEntry {
                    version: entry.version,
                    owning_stores: entry.owning_stores,
                    tombstoned: entry.tombstoned,
                    tombstone_confirms: BTreeSet::new(),
                    created_at: entry.created_at,
                },
            );
        }
        registry
    }
}

impl Default for MemoryItemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable registry state, keyed by item id.
///
/// Nothing outside this subsystem reads the snapshot; the JSON layout is
/// an implementation detail, not a wire contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    entries: BTreeMap<String, SnapshotEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEntry {
    version: u64,
    owning_stores: BTreeSet<StoreId>,
    tombstoned: bool,
    created_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
