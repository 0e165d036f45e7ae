//! Synchronization records and the propagation state machine
//!
//! Every `propagate` call produces one `SyncRecord` spanning all of its
//! target stores. The record carries per-target delivery state, the
//! overall status, and an audit trail preserving the losing side of every
//! resolved conflict. Status only ever moves forward.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::item::{ItemId, MemoryItem};
use crate::store::StoreId;

/// Identifier of one synchronization transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery state of a sync transaction or one of its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Pending,
    Applied,
    Conflict,
    Failed,
}

impl SyncStatus {
    /// Forward-only transition rule:
    /// Pending -> {Applied, Conflict, Failed}; Conflict -> {Applied,
    /// Failed}; terminal states never change.
    pub fn can_transition(self, next: SyncStatus) -> bool {
        match (self, next) {
            (a, b) if a == b => true,
            (SyncStatus::Pending, _) => true,
            (SyncStatus::Conflict, SyncStatus::Applied | SyncStatus::Failed) => true,
            _ => false,
        }
    }
}

/// How a detected conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionStrategy {
    /// A tombstone on either side took precedence
    TombstoneWins,
    /// The copy with the later manager-assigned timestamp was kept
    LastWriterWins,
    /// An explicit resolution call settled a timestamp race
    Manual,
}

/// One entry in a sync record's audit trail.
///
/// The losing side of a resolved conflict is preserved here and nowhere
/// else; stores only ever hold the winner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub store: StoreId,
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discarded: Option<MemoryItem>,
}

/// Delivery state for a single target store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub store: StoreId,
    pub status: SyncStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// State of one synchronization transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub operation_id: OperationId,
    pub item_id: ItemId,
    pub source_store: StoreId,
    /// Targets in propagation order
    pub target_stores: Vec<StoreId>,
    /// Overall status, derived from the per-target states
    pub status: SyncStatus,
    /// Total delivery attempts across all targets
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Populated only when the record reached Applied after a conflict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_strategy: Option<ResolutionStrategy>,
    pub targets: Vec<TargetState>,
    pub audit: Vec<AuditEntry>,
}

impl SyncRecord {
    pub fn new(item_id: ItemId, source_store: StoreId, target_stores: Vec<StoreId>) -> Self {
        let targets = target_stores
            .iter()
            .map(|store| TargetState {
                store: store.clone(),
                status: SyncStatus::Pending,
                attempts: 0,
                last_error: None,
            })
            .collect();
        let status = if target_stores.is_empty() {
            // Nothing to propagate; the transaction is trivially complete.
            SyncStatus::Applied
        } else {
            SyncStatus::Pending
        };
        Self {
            operation_id: OperationId::new(),
            item_id,
            source_store,
            target_stores,
            status,
            attempt_count: 0,
            last_error: None,
            resolution_strategy: None,
            targets,
            audit: Vec::new(),
        }
    }

    /// Per-target states that are still in `Conflict`.
    pub fn conflicted_targets(&self) -> impl Iterator<Item = &TargetState> {
        self.targets
            .iter()
            .filter(|t| t.status == SyncStatus::Conflict)
    }

    pub(crate) fn target_mut(&mut self, store: &StoreId) -> Option<&mut TargetState> {
        self.targets.iter_mut().find(|t| &t.store == store)
    }

    /// Update one target's delivery state and fold the outcome into the
    /// record-level counters and overall status.
    pub(crate) fn record_target(
        &mut self,
        store: &StoreId,
        status: SyncStatus,
        attempts: u32,
        error: Option<String>,
    ) {
        if let Some(target) = self.target_mut(store) {
            if target.status.can_transition(status) {
                target.status = status;
            }
            target.attempts += attempts;
            target.last_error = error.clone();
        }
        self.attempt_count += attempts;
        if error.is_some() {
            self.last_error = error;
        }
        self.recompute_status();
    }

    pub(crate) fn push_audit(
        &mut self,
        store: &StoreId,
        note: impl Into<String>,
        discarded: Option<MemoryItem>,
    ) {
        self.audit.push(AuditEntry {
            at: Utc::now(),
            store: store.clone(),
            note: note.into(),
            discarded,
        });
    }

    /// Derive the overall status from the per-target states, honoring the
    /// forward-only rule: an unresolved conflict dominates, work still in
    /// flight keeps the record pending, exhausted targets mark it failed,
    /// and only a fully delivered transaction is applied.
    pub(crate) fn recompute_status(&mut self) {
        let candidate = if self.targets.iter().any(|t| t.status == SyncStatus::Conflict) {
            SyncStatus::Conflict
        } else if self.targets.iter().any(|t| t.status == SyncStatus::Pending) {
            SyncStatus::Pending
        } else if self.targets.iter().any(|t| t.status == SyncStatus::Failed) {
            SyncStatus::Failed
        } else {
            SyncStatus::Applied
        };
        if self.status != candidate && self.status.can_transition(candidate) {
            self.status = candidate;
        }
    }
}
