//! Filter types for memory queries
//!
//! A `QueryFilter` narrows a query by item type, metadata, text, or a
//! pre-computed embedding. Filters are combined with AND logic; the
//! `QueryFragment` is the store-facing slice of a routed request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::item::{ItemType, MemoryItem, PHASE_KEY};

/// Filter criteria for memory queries.
///
/// All fields are optional - when `None` (or empty), that filter is not
/// applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Free-text relevance query (scored by the serving store)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Pre-computed query embedding for vector similarity search
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Restrict to specific item types (OR logic within this filter)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_types: Option<Vec<ItemType>>,
    /// Metadata equality constraints (AND logic across keys)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl QueryFilter {
    /// Create a new empty filter (no filtering applied)
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by free-text relevance
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Filter by embedding similarity
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Filter by item types
    pub fn with_item_types(mut self, types: Vec<ItemType>) -> Self {
        self.item_types = Some(types);
        self
    }

    /// Add a metadata equality constraint
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Restrict to items tagged with a reasoning phase
    pub fn with_phase(self, phase: impl Into<String>) -> Self {
        self.with_metadata(PHASE_KEY, serde_json::Value::String(phase.into()))
    }

    /// Whether an item satisfies the type and metadata constraints.
    ///
    /// Text and embedding relevance are scoring concerns left to the
    /// serving store; this only checks the hard constraints.
    pub fn matches(&self, item: &MemoryItem) -> bool {
        if let Some(ref types) = self.item_types {
            if !types.is_empty() && !types.contains(&item.item_type) {
                return false;
            }
        }
        self.metadata
            .iter()
            .all(|(key, value)| item.metadata.get(key) == Some(value))
    }
}

/// The store-facing slice of a routed query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFragment {
    pub filter: QueryFilter,
    /// Maximum results per store; 0 means no limit
    #[serde(default)]
    pub top_k: usize,
    /// Traversal depth, only meaningful for graph stores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_depth: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ItemId, Payload};

    fn item_with_phase(phase: &str) -> MemoryItem {
        MemoryItem::new(ItemId::new("f-1"), ItemType::Episodic, Payload::text("x")).with_phase(phase)
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = QueryFilter::new();
        assert!(filter.matches(&item_with_phase("expand")));
    }

    #[test]
    fn test_item_type_filter() {
        let filter = QueryFilter::new().with_item_types(vec![ItemType::Semantic]);
        assert!(!filter.matches(&item_with_phase("expand")));

        let filter = QueryFilter::new().with_item_types(vec![ItemType::Episodic]);
        assert!(filter.matches(&item_with_phase("expand")));
    }

    #[test]
    fn test_metadata_filter_is_exact_equality() {
        let filter = QueryFilter::new().with_phase("refine");
        assert!(filter.matches(&item_with_phase("refine")));
        assert!(!filter.matches(&item_with_phase("expand")));
    }

    #[test]
    fn test_filters_combine_with_and() {
        let filter = QueryFilter::new()
            .with_item_types(vec![ItemType::Episodic])
            .with_phase("expand");
        assert!(filter.matches(&item_with_phase("expand")));
        assert!(!filter.matches(&item_with_phase("retrospect")));
    }
}
