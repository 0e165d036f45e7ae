//! Integration tests for the memory manager facade
//!
//! Covers the full write/read/query/delete lifecycle over fake adapters,
//! including version assignment, asynchronous convergence, tombstone
//! visibility and registry persistence.

use std::sync::Arc;
use std::time::Duration;

use lattice::config::{MemoryConfig, QueryConfig, SyncConfig};
use lattice::error::ManagerError;
use lattice::item::{ItemId, ItemType, MemoryItem, Payload};
use lattice::registry::RegistrySnapshot;
use lattice::router::{QueryPattern, QueryRequest};
use lattice::store::{Capability, QueryFilter, StoreAdapter, StoreDescriptor, StoreId};
use lattice::testing::FakeStore;
use lattice::MemoryManager;

struct Fixture {
    manager: MemoryManager,
    tabular: Arc<FakeStore>,
    vector: Arc<FakeStore>,
    graph: Arc<FakeStore>,
}

fn config_for(stores: &[(&FakeStore, u32)]) -> MemoryConfig {
    MemoryConfig {
        stores: stores
            .iter()
            .map(|(store, priority)| StoreDescriptor {
                store_id: store.store_id().clone(),
                capabilities: store.capabilities(),
                priority: *priority,
            })
            .collect(),
        home_store: None,
        sync: SyncConfig {
            workers: 2,
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_cap_ms: 4,
        },
        query: QueryConfig {
            adapter_timeout_ms: 200,
            ..QueryConfig::default()
        },
    }
}

fn fixture() -> Fixture {
    let tabular = Arc::new(FakeStore::new("tabular", [Capability::StructuredQuery]));
    let vector = Arc::new(FakeStore::new("vector", [Capability::VectorSearch]));
    let graph = Arc::new(FakeStore::new(
        "graph",
        [Capability::GraphTraversal, Capability::TripleQuery],
    ));

    let config = config_for(&[(tabular.as_ref(), 0), (vector.as_ref(), 1), (graph.as_ref(), 2)]);
    let adapters: Vec<Arc<dyn StoreAdapter>> = vec![
        Arc::clone(&tabular) as Arc<dyn StoreAdapter>,
        Arc::clone(&vector) as Arc<dyn StoreAdapter>,
        Arc::clone(&graph) as Arc<dyn StoreAdapter>,
    ];
    let manager = MemoryManager::new(config, adapters).expect("Failed to build manager");

    Fixture {
        manager,
        tabular,
        vector,
        graph,
    }
}

/// Test fixture: a semantic item with the given id and content
fn item(id: &str, content: &str) -> MemoryItem {
    MemoryItem::new(ItemId::new(id), ItemType::Semantic, Payload::text(content))
}

mod write_tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let fix = fixture();
        let written = fix
            .manager
            .write(item("x1", "hello").with_metadata("origin", serde_json::json!("cycle-1")))
            .await
            .unwrap();

        assert_eq!(written.version, 1);
        assert!(written.owning_stores.contains(&StoreId::new("tabular")));

        let read = fix.manager.read(&ItemId::new("x1")).await.unwrap().unwrap();
        assert_eq!(read.payload, written.payload);
        assert_eq!(read.metadata, written.metadata);
    }

    #[tokio::test]
    async fn test_home_store_is_the_preferred_structured_store() {
        let fix = fixture();
        assert_eq!(fix.manager.home_store(), &StoreId::new("tabular"));
    }

    #[tokio::test]
    async fn test_rewrites_bump_the_version() {
        let fix = fixture();
        for expected in 1..=3u64 {
            let written = fix.manager.write(item("v-1", "revision")).await.unwrap();
            assert_eq!(written.version, expected);
        }
        assert_eq!(fix.manager.registry().version(&ItemId::new("v-1")), Some(3));
    }

    #[tokio::test]
    async fn test_concurrent_writes_serialize_per_item() {
        let fix = fixture();
        let manager = Arc::new(fix.manager);

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager
                    .write(item("race-1", &format!("writer {i}")))
                    .await
                    .unwrap()
                    .version
            }));
        }
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap());
        }
        versions.sort_unstable();

        assert_eq!(
            versions,
            (1..=8).collect::<Vec<u64>>(),
            "No two writes observe the same version"
        );
        let stored = fix.tabular.stored(&ItemId::new("race-1")).unwrap();
        assert_eq!(stored.version, 8, "Home store holds the last accepted write");
    }

    #[tokio::test]
    async fn test_write_assigns_missing_id() {
        let fix = fixture();
        let written = fix.manager.write(item("", "anonymous")).await.unwrap();
        assert!(!written.id.is_empty());
        assert!(fix.manager.read(&written.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_caller_supplied_bookkeeping_is_not_trusted() {
        let fix = fixture();
        let mut forged = item("f-1", "forged");
        forged.version = 99;
        forged.owning_stores.insert(StoreId::new("vector"));

        let written = fix.manager.write(forged).await.unwrap();
        assert_eq!(written.version, 1, "Version comes from the registry");
        assert!(
            !written.owning_stores.contains(&StoreId::new("vector")),
            "Ownership reflects actual persistence only"
        );
    }
}

mod convergence_tests {
    use super::*;

    #[tokio::test]
    async fn test_write_returns_before_propagation_completes() {
        let fix = fixture();
        fix.vector.set_delay(Duration::from_millis(30));

        let mut embedded = item("conv-1", "eventually everywhere");
        embedded.payload.embedding = Some(vec![0.2; 4]);
        let written = fix.manager.write(embedded).await.unwrap();

        assert_eq!(
            written.owning_stores.iter().collect::<Vec<_>>(),
            vec![&StoreId::new("tabular")],
            "Immediately after write only the home store owns the item"
        );
        assert!(!fix.vector.contains(&written.id));

        fix.manager.wait_for_sync().await;

        assert!(fix.vector.contains(&written.id));
        let owners = fix.manager.registry().owners(&written.id);
        assert!(owners.contains(&StoreId::new("vector")));
        assert!(owners.contains(&StoreId::new("tabular")));
    }

    #[tokio::test]
    async fn test_sync_record_is_queryable_through_the_facade() {
        let fix = fixture();
        let mut embedded = item("rec-1", "tracked");
        embedded.payload.embedding = Some(vec![0.4; 4]);
        let written = fix.manager.write(embedded).await.unwrap();
        fix.manager.wait_for_sync().await;

        let records = fix.manager.sync_records_for(&written.id);
        assert_eq!(records.len(), 1);
        let status = fix.manager.sync_status(&records[0].operation_id).unwrap();
        assert_eq!(status.operation_id, records[0].operation_id);
        assert!(fix.manager.sync_stats().synchronized >= 1);
    }
}

mod delete_tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_hides_item_while_tombstone_propagates() {
        let fix = fixture();
        fix.vector.set_delay(Duration::from_millis(20));

        let mut embedded = item("d-1", "short lived");
        embedded.payload.embedding = Some(vec![0.3; 4]);
        let written = fix.manager.write(embedded).await.unwrap();
        fix.manager.wait_for_sync().await;
        assert!(fix.vector.contains(&written.id));

        fix.manager.delete(&written.id).await.unwrap();

        assert!(
            fix.manager.read(&written.id).await.unwrap().is_none(),
            "Tombstone hides the item immediately"
        );
        assert!(
            fix.manager.registry().contains(&written.id),
            "Registry tracks the id until every owner confirms the tombstone"
        );

        fix.manager.wait_for_sync().await;

        assert!(
            !fix.manager.registry().contains(&written.id),
            "Entry is pruned after full confirmation"
        );
        assert!(
            fix.vector.stored(&written.id).unwrap().is_tombstone(),
            "The owning vector store received the deletion"
        );
        assert!(fix.manager.read(&written.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_unknown_item_is_not_found() {
        let fix = fixture();
        let err = fix.manager.delete(&ItemId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_new_write_after_delete_starts_a_fresh_lifecycle() {
        let fix = fixture();
        let written = fix.manager.write(item("d-2", "first life")).await.unwrap();
        fix.manager.wait_for_sync().await;
        fix.manager.delete(&written.id).await.unwrap();
        fix.manager.wait_for_sync().await;

        let revived = fix.manager.write(item("d-2", "second life")).await.unwrap();
        assert_eq!(revived.version, 1, "A pruned id restarts its version counter");
        let read = fix.manager.read(&revived.id).await.unwrap().unwrap();
        assert_eq!(read.payload, Payload::text("second life"));
    }
}

mod query_tests {
    use super::*;

    #[tokio::test]
    async fn test_federated_query_through_the_facade() {
        let fix = fixture();
        fix.manager.write(item("q-1", "retrieval target")).await.unwrap();
        fix.manager.write(item("q-2", "unrelated")).await.unwrap();

        let request = QueryRequest::new(QueryPattern::Federated)
            .with_filter(QueryFilter::new().with_text("retrieval"));
        let results = fix.manager.query(&request).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].item.id, ItemId::new("q-1"));
        assert_eq!(results[0].provenance, StoreId::new("tabular"));
        assert_eq!(
            fix.graph.query_count(),
            1,
            "Triple-capable store participates in federated text queries"
        );
    }

    #[tokio::test]
    async fn test_queries_see_writes_that_followed_a_cached_result() {
        let fix = fixture();
        fix.manager.write(item("fresh-1", "first")).await.unwrap();

        let request = QueryRequest::new(QueryPattern::Federated);
        let first = fix.manager.query(&request).await.unwrap();
        assert_eq!(first.len(), 1);

        fix.manager.write(item("fresh-2", "second")).await.unwrap();
        let second = fix.manager.query(&request).await.unwrap();
        assert_eq!(second.len(), 2, "Writes invalidate cached query results");
    }

    #[tokio::test]
    async fn test_phase_tagged_items_are_retrievable_by_phase() {
        let fix = fixture();
        fix.manager
            .write_with_phase(item("ph-1", "expansion result"), "expand")
            .await
            .unwrap();
        fix.manager
            .write_with_phase(item("ph-2", "refinement result"), "refine")
            .await
            .unwrap();

        let request = QueryRequest::new(QueryPattern::Federated)
            .with_filter(QueryFilter::new().with_phase("expand"));
        let results = fix.manager.query(&request).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].item.phase(), Some("expand"));
    }
}

mod persistence_tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let fix = fixture();
        fix.manager.write(item("persist-1", "durable")).await.unwrap();
        fix.manager.write(item("persist-1", "durable v2")).await.unwrap();
        fix.manager.wait_for_sync().await;

        fix.manager.registry_snapshot().save(&path).unwrap();

        // A restarted manager continues the version sequence.
        let tabular = Arc::new(FakeStore::new("tabular", [Capability::StructuredQuery]));
        let vector = Arc::new(FakeStore::new("vector", [Capability::VectorSearch]));
        let graph = Arc::new(FakeStore::new(
            "graph",
            [Capability::GraphTraversal, Capability::TripleQuery],
        ));
        let config = config_for(&[(tabular.as_ref(), 0), (vector.as_ref(), 1), (graph.as_ref(), 2)]);
        let adapters: Vec<Arc<dyn StoreAdapter>> = vec![
            Arc::clone(&tabular) as Arc<dyn StoreAdapter>,
            Arc::clone(&vector) as Arc<dyn StoreAdapter>,
            Arc::clone(&graph) as Arc<dyn StoreAdapter>,
        ];
        let snapshot = RegistrySnapshot::load(&path).unwrap();
        let restored = MemoryManager::with_registry_snapshot(config, adapters, snapshot).unwrap();

        assert_eq!(
            restored.registry().version(&ItemId::new("persist-1")),
            Some(2)
        );
        let written = restored.write(item("persist-1", "after restart")).await.unwrap();
        assert_eq!(written.version, 3);
    }
}
