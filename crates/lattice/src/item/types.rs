//! Core item types for the lattice memory fabric
//!
//! A `MemoryItem` is the unit of storage shared by every backend. Items
//! carry a monotonic per-item version used for conflict detection, the set
//! of stores believed to hold a copy, and manager-assigned timestamps.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::StoreId;

/// Reserved metadata key marking logical deletion.
///
/// A tombstone propagates like any other write so that stores which have
/// not yet seen the deletion still converge on it.
pub const TOMBSTONE_KEY: &str = "lattice.tombstone";

/// Reserved metadata key carrying the caller's reasoning-phase tag.
pub const PHASE_KEY: &str = "lattice.phase";

/// Opaque item identifier, stable across stores.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Classification of memory items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemType {
    /// What happened (events, cycle outcomes)
    Episodic,
    /// Facts and knowledge
    Semantic,
    /// How to do things
    Procedural,
    /// Code and artifact structure
    Structural,
    /// Links between other items
    Relationship,
}

impl ItemType {
    /// Stable name used for deterministic alphabetical tie-breaking.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Episodic => "episodic",
            ItemType::Semantic => "semantic",
            ItemType::Procedural => "procedural",
            ItemType::Structural => "structural",
            ItemType::Relationship => "relationship",
        }
    }
}

/// Item content: raw text or a structured document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Content {
    Text(String),
    Structured(serde_json::Value),
}

impl Content {
    /// Text view of the content, used for naive relevance scoring.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(text),
            Content::Structured(_) => None,
        }
    }
}

/// Item payload: content plus an optional pre-computed embedding.
///
/// Embedding generation is external; payloads arrive already vectorized
/// or without a vector at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Payload {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Content::Text(content.into()),
            embedding: None,
        }
    }

    pub fn structured(value: serde_json::Value) -> Self {
        Self {
            content: Content::Structured(value),
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// A single logical memory item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Opaque identifier, stable across stores
    pub id: ItemId,
    /// Classification of this item
    pub item_type: ItemType,
    /// Content plus optional embedding
    pub payload: Payload,
    /// Ordered metadata mapping; reserved keys use the `lattice.` prefix
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Monotonic per-item logical clock, assigned by the manager
    #[serde(default)]
    pub version: u64,
    /// Stores believed to currently hold a copy
    #[serde(default)]
    pub owning_stores: BTreeSet<StoreId>,
    /// Manager-assigned creation time (not trusted from callers)
    pub created_at: DateTime<Utc>,
    /// Manager-assigned last-write time (not trusted from callers)
    pub updated_at: DateTime<Utc>,
}

impl MemoryItem {
    /// Create a new item with default bookkeeping fields.
    ///
    /// Version, timestamps and owning stores are overwritten by the
    /// manager on write; the values set here only matter for items that
    /// never pass through the facade (tests, fixtures).
    pub fn new(id: ItemId, item_type: ItemType, payload: Payload) -> Self {
        let now = Utc::now();
        Self {
            id,
            item_type,
            payload,
            metadata: BTreeMap::new(),
            version: 0,
            owning_stores: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach a metadata key/value pair.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Tag the item with a reasoning-phase marker.
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.metadata
            .insert(PHASE_KEY.to_string(), serde_json::Value::String(phase.into()));
        self
    }

    /// The reasoning-phase tag, if any.
    pub fn phase(&self) -> Option<&str> {
        self.metadata.get(PHASE_KEY).and_then(|v| v.as_str())
    }

    /// Whether this item is a logical-deletion marker.
    pub fn is_tombstone(&self) -> bool {
        self.metadata
            .get(TOMBSTONE_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Convert this item into its tombstone.
    ///
    /// The payload is blanked so deleted content cannot resurface through
    /// propagation; the losing content of a conflict survives only in the
    /// sync audit trail.
    pub fn into_tombstone(mut self) -> Self {
        self.payload = Payload::text("");
        self.metadata
            .insert(TOMBSTONE_KEY.to_string(), serde_json::Value::Bool(true));
        self
    }
}
