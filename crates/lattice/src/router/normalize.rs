//! Score normalization and result merging
//!
//! Native store scores live on incomparable scales (cosine similarity,
//! graph-path length, SQL relevance). Each store's batch is min-max
//! normalized into [0, 1] against its own score range before results are
//! merged across stores.

use std::collections::HashMap;

use crate::item::ItemId;
use crate::router::RankedItem;
use crate::store::{ScoredItem, StoreId, StoreSet};

/// Normalize one store's batch into [0, 1].
///
/// A single-result batch, or a batch where every score is equal, carries
/// no ranking information of its own and normalizes to 1.0.
pub(crate) fn normalize_batch(scored: Vec<ScoredItem>, store: &StoreId) -> Vec<RankedItem> {
    if scored.is_empty() {
        return Vec::new();
    }

    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for entry in &scored {
        min = min.min(entry.score);
        max = max.max(entry.score);
    }
    let span = max - min;

    scored
        .into_iter()
        .map(|entry| {
            let score = if span.abs() < f64::EPSILON {
                1.0
            } else {
                (entry.score - min) / span
            };
            RankedItem {
                item: entry.item,
                score,
                provenance: store.clone(),
            }
        })
        .collect()
}

fn store_priority(stores: &StoreSet, id: &StoreId) -> u32 {
    stores.priority(id).unwrap_or(u32::MAX)
}

/// Merge a normalized batch into the accumulated result set.
///
/// Duplicates (same id) keep the maximum normalized score; an exact score
/// tie keeps the copy from the more preferred store.
pub(crate) fn merge_into(
    acc: &mut HashMap<ItemId, RankedItem>,
    batch: Vec<RankedItem>,
    stores: &StoreSet,
) {
    for candidate in batch {
        let replace = match acc.get(&candidate.item.id) {
            None => true,
            Some(current) => match candidate.score.total_cmp(&current.score) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Equal => {
                    store_priority(stores, &candidate.provenance)
                        < store_priority(stores, &current.provenance)
                }
                std::cmp::Ordering::Less => false,
            },
        };
        if replace {
            acc.insert(candidate.item.id.clone(), candidate);
        }
    }
}

/// Order merged results and apply the result limit.
///
/// Equal scores break ties by store priority, then by item type name,
/// then by id, so repeated queries are reproducible.
pub(crate) fn finalize(
    acc: HashMap<ItemId, RankedItem>,
    stores: &StoreSet,
    top_k: usize,
) -> Vec<RankedItem> {
    let mut ranked: Vec<RankedItem> = acc.into_values().collect();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| {
                store_priority(stores, &a.provenance).cmp(&store_priority(stores, &b.provenance))
            })
            .then_with(|| a.item.item_type.as_str().cmp(b.item.item_type.as_str()))
            .then_with(|| a.item.id.cmp(&b.item.id))
    });
    if top_k > 0 {
        ranked.truncate(top_k);
    }
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ItemType, MemoryItem, Payload};
    use crate::store::{Capability, StoreDescriptor};
    use crate::testing::FakeStore;
    use std::sync::Arc;

    fn item(id: &str) -> MemoryItem {
        MemoryItem::new(ItemId::new(id), ItemType::Semantic, Payload::text(id))
    }

    fn scored(id: &str, score: f64) -> ScoredItem {
        ScoredItem::new(item(id), score)
    }

    fn store_set() -> StoreSet {
        let structured = crate::store::CapabilitySet::of([Capability::StructuredQuery]);
        let descriptors = vec![
            StoreDescriptor {
                store_id: StoreId::new("a"),
                capabilities: structured.clone(),
                priority: 0,
            },
            StoreDescriptor {
                store_id: StoreId::new("b"),
                capabilities: structured,
                priority: 1,
            },
        ];
        let adapters: Vec<Arc<dyn crate::store::StoreAdapter>> = vec![
            Arc::new(FakeStore::new("a", [Capability::StructuredQuery])),
            Arc::new(FakeStore::new("b", [Capability::StructuredQuery])),
        ];
        StoreSet::new(&descriptors, adapters)
    }

    #[test]
    fn test_normalize_maps_batch_extremes_to_unit_range() {
        let batch = vec![scored("x", 10.0), scored("y", 20.0), scored("z", 15.0)];
        let ranked = normalize_batch(batch, &StoreId::new("a"));

        assert_eq!(ranked[0].score, 0.0);
        assert_eq!(ranked[1].score, 1.0);
        assert_eq!(ranked[2].score, 0.5);
    }

    #[test]
    fn test_normalize_single_result_scores_one() {
        let ranked = normalize_batch(vec![scored("x", -37.2)], &StoreId::new("a"));
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].score, 1.0);
    }

    #[test]
    fn test_normalize_uniform_batch_scores_one() {
        let batch = vec![scored("x", 3.0), scored("y", 3.0)];
        let ranked = normalize_batch(batch, &StoreId::new("a"));
        assert!(ranked.iter().all(|r| r.score == 1.0));
    }

    #[test]
    fn test_merge_keeps_max_score_and_its_provenance() {
        let stores = store_set();
        let mut acc = HashMap::new();

        merge_into(
            &mut acc,
            normalize_batch(vec![scored("dup", 1.0), scored("only-a", 0.2)], &StoreId::new("a")),
            &stores,
        );
        merge_into(
            &mut acc,
            normalize_batch(vec![scored("dup", 9.0), scored("only-b", 4.0)], &StoreId::new("b")),
            &stores,
        );

        assert_eq!(acc.len(), 3, "Each id appears exactly once after merge");
        let dup = &acc[&ItemId::new("dup")];
        assert_eq!(dup.score, 1.0);
        assert_eq!(dup.provenance, StoreId::new("b"), "Max came from store b's batch");
    }

    #[test]
    fn test_merge_tie_prefers_lower_priority_store() {
        let stores = store_set();
        let mut acc = HashMap::new();

        merge_into(
            &mut acc,
            normalize_batch(vec![scored("dup", 5.0)], &StoreId::new("b")),
            &stores,
        );
        merge_into(
            &mut acc,
            normalize_batch(vec![scored("dup", 5.0)], &StoreId::new("a")),
            &stores,
        );

        assert_eq!(acc[&ItemId::new("dup")].provenance, StoreId::new("a"));
    }

    #[test]
    fn test_finalize_orders_deterministically() {
        let stores = store_set();
        let mut acc = HashMap::new();
        let mut episodic = item("tie-episodic");
        episodic.item_type = ItemType::Episodic;
        acc.insert(
            episodic.id.clone(),
            RankedItem {
                item: episodic,
                score: 0.5,
                provenance: StoreId::new("a"),
            },
        );
        acc.insert(
            ItemId::new("tie-semantic"),
            RankedItem {
                item: item("tie-semantic"),
                score: 0.5,
                provenance: StoreId::new("a"),
            },
        );
        acc.insert(
            ItemId::new("winner"),
            RankedItem {
                item: item("winner"),
                score: 0.9,
                provenance: StoreId::new("b"),
            },
        );

        let ranked = finalize(acc, &stores, 0);
        assert_eq!(ranked[0].item.id, ItemId::new("winner"));
        assert_eq!(
            ranked[1].item.item_type,
            ItemType::Episodic,
            "Score ties order by item type name"
        );
        assert_eq!(ranked[2].item.id, ItemId::new("tie-semantic"));
    }

    #[test]
    fn test_finalize_applies_limit() {
        let stores = store_set();
        let mut acc = HashMap::new();
        for i in 0..5 {
            let id = format!("k-{i}");
            acc.insert(
                ItemId::new(id.clone()),
                RankedItem {
                    item: item(&id),
                    score: i as f64 / 10.0,
                    provenance: StoreId::new("a"),
                },
            );
        }
        assert_eq!(finalize(acc, &stores, 2).len(), 2);
    }
}
