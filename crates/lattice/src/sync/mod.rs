//! Synchronization manager
//!
//! Propagates accepted writes from their source store to every other
//! capable store, detects version conflicts, resolves them through the
//! documented policy, and records everything in per-operation sync
//! records.
//!
//! Propagation runs on a worker pool whose queue is sharded by item id:
//! every task for the same item lands on the same worker and is processed
//! in submission order, so writes to one item are never reordered
//! downstream. Transient target failures retry with bounded exponential
//! backoff; exhausting the attempts fails that target only, without
//! rolling back the other targets of the same transaction.

pub mod record;

pub use record::{
    AuditEntry, OperationId, ResolutionStrategy, SyncRecord, SyncStatus, TargetState,
};

use std::cmp::Ordering as CmpOrdering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::{AdapterError, SyncError};
use crate::item::{ItemId, MemoryItem};
use crate::registry::MemoryItemRegistry;
use crate::store::{StoreId, StoreSet};

/// One unit of propagation work: apply `item` to `target`.
struct PropagationTask {
    operation_id: OperationId,
    item: MemoryItem,
    target: StoreId,
}

/// A conflict awaiting explicit resolution after a timestamp race.
struct PendingConflict {
    operation_id: OperationId,
    source: StoreId,
    target: StoreId,
    incoming: MemoryItem,
}

#[derive(Default)]
struct SyncCounters {
    synchronized: AtomicU64,
    conflicts: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time snapshot of synchronization counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Propagations applied to a target store
    pub synchronized: u64,
    /// Conflicts detected (including automatically resolved ones)
    pub conflicts: u64,
    /// Targets that exhausted their delivery attempts
    pub failed: u64,
}

/// Outcome of one apply attempt against a target store.
enum ApplyOutcome {
    Applied {
        resolution: Option<ResolutionStrategy>,
        discarded: Option<MemoryItem>,
        stored_tombstone: bool,
        note: Option<String>,
    },
    ConflictPending {
        existing: MemoryItem,
    },
}

impl ApplyOutcome {
    fn clean(stored_tombstone: bool) -> Self {
        ApplyOutcome::Applied {
            resolution: None,
            discarded: None,
            stored_tombstone,
            note: None,
        }
    }
}

/// Keeps the same logical item consistent across independently written
/// stores.
pub struct SyncManager {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    stores: Arc<StoreSet>,
    registry: Arc<MemoryItemRegistry>,
    config: SyncConfig,
    records: DashMap<OperationId, SyncRecord>,
    pending_conflicts: DashMap<ItemId, Vec<PendingConflict>>,
    workers: Vec<mpsc::UnboundedSender<PropagationTask>>,
    in_flight: AtomicUsize,
    idle: Notify,
    counters: SyncCounters,
}

impl SyncManager {
    /// Create the manager and spawn its worker pool.
    ///
    /// Must be called from within a tokio runtime. Workers exit when the
    /// manager is dropped and their queues drain.
    pub fn new(
        stores: Arc<StoreSet>,
        registry: Arc<MemoryItemRegistry>,
        config: SyncConfig,
    ) -> Self {
        let worker_count = config.workers.max(1);
        let mut senders = Vec::with_capacity(worker_count);
        let mut receivers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }

        let inner = Arc::new(SyncInner {
            stores,
            registry,
            config,
            records: DashMap::new(),
            pending_conflicts: DashMap::new(),
            workers: senders,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            counters: SyncCounters::default(),
        });

        for (index, rx) in receivers.into_iter().enumerate() {
            let inner = Arc::clone(&inner);
            tokio::spawn(worker_loop(index, rx, inner));
        }

        Self { inner }
    }

    /// Enqueue propagation of an accepted write to every other capable or
    /// owning store. Returns immediately with the transaction's sync
    /// record; delivery happens asynchronously.
    ///
    /// Owning stores are included even when the write itself no longer
    /// qualifies them by capability: a tombstone carries no embedding, yet
    /// it must still reach the vector store that holds the live copy.
    pub fn propagate(&self, item: &MemoryItem, source: &StoreId) -> SyncRecord {
        let mut targets: Vec<StoreId> = self.inner.stores.eligible_for_item(item);
        for owner in self.inner.registry.owners(&item.id) {
            if !targets.contains(&owner) && self.inner.stores.contains(&owner) {
                targets.push(owner);
            }
        }
        targets.retain(|store| store != source);

        let record = SyncRecord::new(item.id.clone(), source.clone(), targets.clone());
        debug!(
            item_id = %item.id,
            version = item.version,
            operation_id = %record.operation_id,
            targets = targets.len(),
            "Enqueueing propagation"
        );
        self.inner
            .records
            .insert(record.operation_id, record.clone());

        for target in targets {
            self.inner.enqueue(PropagationTask {
                operation_id: record.operation_id,
                item: item.clone(),
                target,
            });
        }
        record
    }

    /// Current state of one sync transaction.
    pub fn status(&self, operation_id: &OperationId) -> Option<SyncRecord> {
        self.inner.records.get(operation_id).map(|r| r.value().clone())
    }

    /// All sync records touching an item, in unspecified order.
    pub fn records_for(&self, item_id: &ItemId) -> Vec<SyncRecord> {
        self.inner
            .records
            .iter()
            .filter(|r| &r.item_id == item_id)
            .map(|r| r.value().clone())
            .collect()
    }

    /// Whether the item has a conflict awaiting explicit resolution.
    pub fn has_pending_conflict(&self, item_id: &ItemId) -> bool {
        self.inner
            .pending_conflicts
            .get(item_id)
            .map(|p| !p.is_empty())
            .unwrap_or(false)
    }

    /// Re-run the resolution policy for an item whose propagation hit a
    /// timestamp race. A still-equal race breaks the tie by store
    /// priority, so resolution is deterministic.
    pub async fn resolve_conflict(&self, item_id: &ItemId) -> Result<MemoryItem, SyncError> {
        let (_, pending) = self
            .inner
            .pending_conflicts
            .remove(item_id)
            .ok_or_else(|| SyncError::UnresolvedConflict(item_id.to_string()))?;
        if pending.is_empty() {
            return Err(SyncError::UnresolvedConflict(item_id.to_string()));
        }

        let mut winner = None;
        for conflict in pending {
            winner = Some(self.inner.resolve_one(item_id, conflict).await?);
        }
        winner.ok_or_else(|| SyncError::UnresolvedConflict(item_id.to_string()))
    }

    /// Snapshot of the synchronization counters.
    pub fn stats(&self) -> SyncStats {
        SyncStats {
            synchronized: self.inner.counters.synchronized.load(Ordering::Relaxed),
            conflicts: self.inner.counters.conflicts.load(Ordering::Relaxed),
            failed: self.inner.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Wait until every enqueued propagation task has been processed.
    pub async fn quiesce(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn worker_loop(
    index: usize,
    mut rx: mpsc::UnboundedReceiver<PropagationTask>,
    inner: Arc<SyncInner>,
) {
    debug!(worker = index, "Sync worker started");
    while let Some(task) = rx.recv().await {
        inner.process(task).await;
        if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            inner.idle.notify_waiters();
        }
    }
    debug!(worker = index, "Sync worker stopped");
}

impl SyncInner {
    fn shard_index(&self, id: &ItemId) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() as usize) % self.workers.len()
    }

    /// Route a task to its item's worker, preserving per-item FIFO order.
    fn enqueue(&self, task: PropagationTask) {
        let shard = self.shard_index(&task.item.id);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.workers[shard].send(task).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            warn!("Sync worker channel closed, dropping propagation task");
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.config.backoff_cap_ms);
        Duration::from_millis(delay)
    }

    fn with_record(&self, operation_id: &OperationId, update: impl FnOnce(&mut SyncRecord)) {
        if let Some(mut record) = self.records.get_mut(operation_id) {
            update(&mut record);
        }
    }

    /// Deliver one task, retrying transient failures with backoff.
    async fn process(&self, task: PropagationTask) {
        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            match self.try_apply(&task).await {
                Ok(outcome) => break Ok(outcome),
                Err(AdapterError::Unavailable(reason))
                    if attempts < self.config.max_attempts =>
                {
                    debug!(
                        item_id = %task.item.id,
                        target = %task.target,
                        attempt = attempts,
                        reason = %reason,
                        "Target unavailable, backing off"
                    );
                    tokio::time::sleep(self.backoff(attempts)).await;
                }
                Err(err) => break Err(err),
            }
        };

        match outcome {
            Ok(ApplyOutcome::Applied {
                resolution,
                discarded,
                stored_tombstone,
                note,
            }) => {
                self.registry.record_owner(&task.item.id, &task.target);
                if stored_tombstone {
                    self.registry.confirm_tombstone(&task.item.id, &task.target);
                }
                self.counters.synchronized.fetch_add(1, Ordering::Relaxed);
                if resolution.is_some() {
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                }
                self.with_record(&task.operation_id, |record| {
                    record.record_target(&task.target, SyncStatus::Applied, attempts, None);
                    if let Some(strategy) = resolution {
                        record.resolution_strategy = Some(strategy);
                    }
                    if let Some(note) = note {
                        record.push_audit(&task.target, note, discarded);
                    }
                });
            }
            Ok(ApplyOutcome::ConflictPending { existing }) => {
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    item_id = %task.item.id,
                    target = %task.target,
                    "Timestamp race detected, holding conflict for explicit resolution"
                );
                let record_source = self
                    .records
                    .get(&task.operation_id)
                    .map(|r| r.source_store.clone())
                    .unwrap_or_else(|| StoreId::new(""));
                self.pending_conflicts
                    .entry(task.item.id.clone())
                    .or_default()
                    .push(PendingConflict {
                        operation_id: task.operation_id,
                        source: record_source,
                        target: task.target.clone(),
                        incoming: task.item.clone(),
                    });
                self.with_record(&task.operation_id, |record| {
                    record.record_target(&task.target, SyncStatus::Conflict, attempts, None);
                    record.push_audit(
                        &task.target,
                        "timestamp race, awaiting explicit resolution",
                        Some(existing),
                    );
                });
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    item_id = %task.item.id,
                    target = %task.target,
                    attempts,
                    error = %err,
                    "Propagation to target failed"
                );
                self.with_record(&task.operation_id, |record| {
                    record.record_target(
                        &task.target,
                        SyncStatus::Failed,
                        attempts,
                        Some(err.to_string()),
                    );
                });
            }
        }
    }

    /// One apply attempt: read the target's copy, detect conflicts, and
    /// apply the resolution policy.
    ///
    /// A conflict exists only when the target's version is greater than
    /// the incoming one - the target already holds information the source
    /// never saw. Equal versions are duplicate replays, not conflicts.
    async fn try_apply(&self, task: &PropagationTask) -> Result<ApplyOutcome, AdapterError> {
        let adapter = self.stores.adapter(&task.target).ok_or_else(|| {
            AdapterError::Malformed(format!("no adapter registered for store {}", task.target))
        })?;
        let incoming = &task.item;

        let current = match adapter.get(&incoming.id).await? {
            Some(current) => current,
            None => {
                adapter.put(incoming).await?;
                return Ok(ApplyOutcome::clean(incoming.is_tombstone()));
            }
        };

        if current.version <= incoming.version {
            // In-order delivery or a duplicate replay; put is idempotent
            // per (id, version) so applying again is safe either way.
            adapter.put(incoming).await?;
            return Ok(ApplyOutcome::clean(incoming.is_tombstone()));
        }

        // Conflict. Tombstones take precedence so deleted data cannot be
        // resurrected by a late live write.
        if current.is_tombstone() {
            return Ok(ApplyOutcome::Applied {
                resolution: Some(ResolutionStrategy::TombstoneWins),
                discarded: Some(incoming.clone()),
                stored_tombstone: true,
                note: Some("tombstone already on target took precedence".to_string()),
            });
        }
        if incoming.is_tombstone() {
            adapter.put(incoming).await?;
            return Ok(ApplyOutcome::Applied {
                resolution: Some(ResolutionStrategy::TombstoneWins),
                discarded: Some(current),
                stored_tombstone: true,
                note: Some("incoming tombstone overrode a fresher live copy".to_string()),
            });
        }

        match incoming.updated_at.cmp(&current.updated_at) {
            CmpOrdering::Greater => {
                adapter.put(incoming).await?;
                Ok(ApplyOutcome::Applied {
                    resolution: Some(ResolutionStrategy::LastWriterWins),
                    discarded: Some(current),
                    stored_tombstone: false,
                    note: Some("kept incoming write with later timestamp".to_string()),
                })
            }
            CmpOrdering::Less => Ok(ApplyOutcome::Applied {
                resolution: Some(ResolutionStrategy::LastWriterWins),
                discarded: Some(incoming.clone()),
                stored_tombstone: false,
                note: Some("kept target copy with later timestamp".to_string()),
            }),
            CmpOrdering::Equal => Ok(ApplyOutcome::ConflictPending { existing: current }),
        }
    }

    /// Settle one held conflict against the target's current state.
    async fn resolve_one(
        &self,
        item_id: &ItemId,
        conflict: PendingConflict,
    ) -> Result<MemoryItem, SyncError> {
        let adapter = self
            .stores
            .adapter(&conflict.target)
            .ok_or_else(|| SyncError::UnresolvedConflict(item_id.to_string()))?;

        let current = adapter
            .get(item_id)
            .await
            .map_err(|_| SyncError::AttemptsExhausted(item_id.to_string()))?;
        let incoming = conflict.incoming;

        let (winner, resolution, discarded) = match current {
            None => (incoming, ResolutionStrategy::Manual, None),
            Some(current) => {
                if current.is_tombstone() {
                    (current, ResolutionStrategy::TombstoneWins, Some(incoming))
                } else if incoming.is_tombstone() {
                    (incoming, ResolutionStrategy::TombstoneWins, Some(current))
                } else {
                    match incoming.updated_at.cmp(&current.updated_at) {
                        CmpOrdering::Greater => {
                            (incoming, ResolutionStrategy::LastWriterWins, Some(current))
                        }
                        CmpOrdering::Less => {
                            (current, ResolutionStrategy::LastWriterWins, Some(incoming))
                        }
                        CmpOrdering::Equal => {
                            // Deterministic tie-break: the more preferred
                            // store's copy wins.
                            let incoming_priority = self
                                .stores
                                .priority(&conflict.source)
                                .unwrap_or(u32::MAX);
                            let target_priority = self
                                .stores
                                .priority(&conflict.target)
                                .unwrap_or(u32::MAX);
                            if incoming_priority <= target_priority {
                                (incoming, ResolutionStrategy::Manual, Some(current))
                            } else {
                                (current, ResolutionStrategy::Manual, Some(incoming))
                            }
                        }
                    }
                }
            }
        };

        adapter
            .put(&winner)
            .await
            .map_err(|_| SyncError::AttemptsExhausted(item_id.to_string()))?;

        self.registry.record_owner(item_id, &conflict.target);
        if winner.is_tombstone() {
            self.registry.confirm_tombstone(item_id, &conflict.target);
        }
        self.counters.synchronized.fetch_add(1, Ordering::Relaxed);

        self.with_record(&conflict.operation_id, |record| {
            record.record_target(&conflict.target, SyncStatus::Applied, 1, None);
            record.resolution_strategy = Some(resolution);
            record.push_audit(
                &conflict.target,
                format!("conflict resolved via {resolution:?}"),
                discarded,
            );
        });

        debug!(
            item_id = %item_id,
            target = %conflict.target,
            strategy = ?resolution,
            "Conflict resolved"
        );
        Ok(winner)
    }
}
