//! Query router
//!
//! Plans and executes direct, cross-store, cascading, federated and
//! context-aware queries against the registered store adapters, then
//! merges and ranks the heterogeneous result sets.
//!
//! Failure semantics: an adapter that fails or exceeds its call timeout
//! is skipped and the remaining adapters still contribute partial
//! results; only a fan-out in which every adapter fails surfaces
//! [`RouterError::AllBackendsUnavailable`].

mod normalize;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::QueryConfig;
use crate::error::{AdapterError, RouterError};
use crate::item::{ItemId, MemoryItem};
use crate::registry::MemoryItemRegistry;
use crate::store::{QueryFilter, QueryFragment, RegisteredStore, StoreId, StoreSet};

use normalize::{finalize, merge_into, normalize_batch};

/// Routing strategy for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryPattern {
    /// Query one named store
    Direct(StoreId),
    /// Fan out to an explicit store set concurrently
    CrossStore(Vec<StoreId>),
    /// Query stores in the given order, stopping once enough distinct
    /// results have accumulated; trades completeness for latency
    Cascading {
        stores: Vec<StoreId>,
        min_results: usize,
    },
    /// Fan out to every store capable of serving the filter
    Federated,
    /// Resolve context tags to a configured store subset, then fan out
    ContextAware { context_tags: Vec<String> },
}

/// An abstract query against the memory fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub pattern: QueryPattern,
    #[serde(default)]
    pub filter: QueryFilter,
    /// Maximum results to return; 0 uses the configured default
    #[serde(default)]
    pub top_k: usize,
    /// Traversal depth, only meaningful for graph stores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_depth: Option<u32>,
}

impl QueryRequest {
    pub fn new(pattern: QueryPattern) -> Self {
        Self {
            pattern,
            filter: QueryFilter::new(),
            top_k: 0,
            graph_depth: None,
        }
    }

    pub fn with_filter(mut self, filter: QueryFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_graph_depth(mut self, depth: u32) -> Self {
        self.graph_depth = Some(depth);
        self
    }
}

/// A query result with its normalized score and provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedItem {
    pub item: MemoryItem,
    /// Normalized relevance in [0, 1]
    pub score: f64,
    /// Store that produced the winning score for this item
    pub provenance: StoreId,
}

/// Routes abstract queries to store adapters and merges their results.
pub struct QueryRouter {
    stores: Arc<StoreSet>,
    registry: Arc<MemoryItemRegistry>,
    config: QueryConfig,
    cache: Mutex<LruCache<String, Vec<RankedItem>>>,
}

impl QueryRouter {
    pub fn new(
        stores: Arc<StoreSet>,
        registry: Arc<MemoryItemRegistry>,
        config: QueryConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            stores,
            registry,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Execute a query request and return ranked, deduplicated results.
    pub async fn execute(&self, request: &QueryRequest) -> Result<Vec<RankedItem>, RouterError> {
        let top_k = if request.top_k == 0 {
            self.config.default_top_k
        } else {
            request.top_k
        };
        let fragment = QueryFragment {
            filter: request.filter.clone(),
            top_k,
            graph_depth: request.graph_depth,
        };

        let cache_key = serde_json::to_string(request).ok();
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.lock().unwrap().get(key) {
                debug!(pattern = ?request.pattern, "Serving query from cache");
                return Ok(hit.clone());
            }
        }

        let ranked = match &request.pattern {
            QueryPattern::Direct(store) => {
                let store = self.lookup(store)?;
                self.fan_out(vec![store], &fragment, top_k).await?
            }
            QueryPattern::CrossStore(stores) => {
                let stores = self.lookup_all(stores)?;
                self.fan_out(stores, &fragment, top_k).await?
            }
            QueryPattern::Cascading {
                stores,
                min_results,
            } => {
                let stores = self.lookup_all(stores)?;
                self.cascade(stores, &fragment, top_k, *min_results).await?
            }
            QueryPattern::Federated => {
                let stores = self.stores.eligible_for_query(&fragment);
                if stores.is_empty() {
                    return Err(RouterError::InvalidPattern(
                        "no store is capable of serving a federated query with this filter"
                            .to_string(),
                    ));
                }
                self.fan_out(stores, &fragment, top_k).await?
            }
            QueryPattern::ContextAware { context_tags } => {
                let stores = self.resolve_context(context_tags)?;
                self.fan_out(stores, &fragment, top_k).await?
            }
        };

        if let Some(key) = cache_key {
            self.cache.lock().unwrap().put(key, ranked.clone());
        }
        Ok(ranked)
    }

    /// Drop all cached query results. Called by the facade on every
    /// accepted write so queries never serve stale state.
    pub fn invalidate_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    fn lookup(&self, id: &StoreId) -> Result<RegisteredStore, RouterError> {
        self.stores
            .get(id)
            .cloned()
            .ok_or_else(|| RouterError::InvalidPattern(format!("unknown store {id}")))
    }

    fn lookup_all(&self, ids: &[StoreId]) -> Result<Vec<RegisteredStore>, RouterError> {
        if ids.is_empty() {
            return Err(RouterError::InvalidPattern(
                "query pattern names an empty store list".to_string(),
            ));
        }
        ids.iter().map(|id| self.lookup(id)).collect()
    }

    /// Resolve context tags to their configured store subset.
    fn resolve_context(&self, tags: &[String]) -> Result<Vec<RegisteredStore>, RouterError> {
        if tags.is_empty() {
            return Err(RouterError::InvalidPattern(
                "context-aware query requires at least one context tag".to_string(),
            ));
        }

        let mut resolved: Vec<RegisteredStore> = Vec::new();
        for tag in tags {
            let Some(route) = self.config.context_routes.get(tag) else {
                continue;
            };
            for id in route {
                if resolved.iter().any(|s| &s.store_id == id) {
                    continue;
                }
                match self.stores.get(id) {
                    Some(store) => resolved.push(store.clone()),
                    None => warn!(store = %id, tag = %tag, "Context route names an unregistered store"),
                }
            }
        }

        if resolved.is_empty() {
            return Err(RouterError::InvalidPattern(format!(
                "no store route configured for context tags {tags:?}"
            )));
        }
        Ok(resolved)
    }

    /// Concurrent fan-out with per-adapter timeouts and partial-failure
    /// tolerance.
    async fn fan_out(
        &self,
        stores: Vec<RegisteredStore>,
        fragment: &QueryFragment,
        top_k: usize,
    ) -> Result<Vec<RankedItem>, RouterError> {
        if stores.is_empty() {
            return Err(RouterError::InvalidPattern(
                "query pattern resolved to an empty store set".to_string(),
            ));
        }

        let outcomes = join_all(stores.iter().map(|s| self.query_store(s, fragment))).await;

        let mut merged: HashMap<ItemId, RankedItem> = HashMap::new();
        let mut successes = 0usize;
        for (store, outcome) in stores.iter().zip(outcomes) {
            match outcome {
                Ok(batch) => {
                    successes += 1;
                    merge_into(&mut merged, batch, &self.stores);
                }
                Err(err) => {
                    warn!(store = %store.store_id, error = %err, "Adapter failed during fan-out, continuing with remaining stores");
                }
            }
        }

        if successes == 0 {
            return Err(RouterError::AllBackendsUnavailable);
        }
        Ok(finalize(merged, &self.stores, top_k))
    }

    /// Query stores in order, stopping once the deduplicated result count
    /// reaches `min_results`.
    async fn cascade(
        &self,
        stores: Vec<RegisteredStore>,
        fragment: &QueryFragment,
        top_k: usize,
        min_results: usize,
    ) -> Result<Vec<RankedItem>, RouterError> {
        if stores.is_empty() {
            return Err(RouterError::InvalidPattern(
                "query pattern names an empty store list".to_string(),
            ));
        }

        let mut merged: HashMap<ItemId, RankedItem> = HashMap::new();
        let mut successes = 0usize;
        for store in &stores {
            match self.query_store(store, fragment).await {
                Ok(batch) => {
                    successes += 1;
                    merge_into(&mut merged, batch, &self.stores);
                    if min_results > 0 && merged.len() >= min_results {
                        debug!(store = %store.store_id, results = merged.len(), "Cascading query satisfied early");
                        break;
                    }
                }
                Err(err) => {
                    warn!(store = %store.store_id, error = %err, "Adapter failed during cascade, trying next store");
                }
            }
        }

        if successes == 0 {
            return Err(RouterError::AllBackendsUnavailable);
        }
        Ok(finalize(merged, &self.stores, top_k))
    }

    /// One bounded adapter call: timeout counts as unavailability, and
    /// tombstoned items never leave the router.
    async fn query_store(
        &self,
        store: &RegisteredStore,
        fragment: &QueryFragment,
    ) -> Result<Vec<RankedItem>, AdapterError> {
        let timeout = Duration::from_millis(self.config.adapter_timeout_ms);
        let scored = match tokio::time::timeout(timeout, store.adapter.query(fragment)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AdapterError::Unavailable(format!(
                    "query timed out after {}ms",
                    self.config.adapter_timeout_ms
                )));
            }
        };

        let live: Vec<_> = scored
            .into_iter()
            .filter(|s| !s.item.is_tombstone() && !self.registry.is_tombstoned(&s.item.id))
            .collect();
        Ok(normalize_batch(live, &store.store_id))
    }
}
