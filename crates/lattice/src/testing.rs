//! Test utilities for lattice - in-memory fake store adapter
//!
//! `FakeStore` implements the full adapter contract against a concurrent
//! in-memory map, with hooks for failure injection, artificial latency,
//! fixed score overrides and call counting so routing and propagation
//! behavior can be asserted deterministically.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::AdapterError;
use crate::item::{ItemId, MemoryItem};
use crate::store::{Capability, CapabilitySet, QueryFragment, ScoredItem, StoreAdapter, StoreId};

/// In-memory store adapter for tests.
pub struct FakeStore {
    store_id: StoreId,
    capabilities: CapabilitySet,
    items: DashMap<ItemId, MemoryItem>,
    score_overrides: DashMap<ItemId, f64>,
    unavailable: AtomicBool,
    delay: Mutex<Option<Duration>>,
    query_count: AtomicUsize,
    put_count: AtomicUsize,
}

impl FakeStore {
    pub fn new(id: impl Into<String>, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            store_id: StoreId::new(id),
            capabilities: CapabilitySet::of(capabilities),
            items: DashMap::new(),
            score_overrides: DashMap::new(),
            unavailable: AtomicBool::new(false),
            delay: Mutex::new(None),
            query_count: AtomicUsize::new(0),
            put_count: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent call fail with `AdapterError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every subsequent call, for timeout tests.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Pin the native score this store reports for an item.
    pub fn set_score(&self, id: impl Into<String>, score: f64) {
        self.score_overrides.insert(ItemId::new(id), score);
    }

    /// Number of `query` calls served (including failed ones).
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    /// Number of `put` calls served.
    pub fn put_count(&self) -> usize {
        self.put_count.load(Ordering::SeqCst)
    }

    /// Direct inspection of the stored copy, bypassing the adapter
    /// contract.
    pub fn stored(&self, id: &ItemId) -> Option<MemoryItem> {
        self.items.get(id).map(|i| i.value().clone())
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Seed store state directly, bypassing put bookkeeping. Used to set
    /// up divergent copies for conflict tests.
    pub fn insert_raw(&self, item: MemoryItem) {
        self.items.insert(item.id.clone(), item);
    }

    async fn gate(&self) -> Result<(), AdapterError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AdapterError::Unavailable(format!(
                "{} is offline",
                self.store_id
            )));
        }
        Ok(())
    }

    fn native_score(&self, item: &MemoryItem, fragment: &QueryFragment) -> Option<f64> {
        if let Some(score) = self.score_overrides.get(&item.id) {
            return Some(*score);
        }
        if let Some(query_embedding) = &fragment.filter.embedding {
            if let Some(embedding) = &item.payload.embedding {
                return Some(cosine_similarity(query_embedding, embedding));
            }
        }
        if let Some(text) = &fragment.filter.text {
            let needle = text.to_lowercase();
            let haystack = item
                .payload
                .content
                .as_text()
                .map(|t| t.to_lowercase())
                .unwrap_or_default();
            let occurrences = haystack.matches(&needle).count();
            if occurrences == 0 {
                return None;
            }
            return Some(occurrences as f64);
        }
        Some(1.0)
    }
}

#[async_trait]
impl StoreAdapter for FakeStore {
    fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    async fn put(&self, item: &MemoryItem) -> Result<(), AdapterError> {
        self.gate().await?;
        self.put_count.fetch_add(1, Ordering::SeqCst);
        self.items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn get(&self, id: &ItemId) -> Result<Option<MemoryItem>, AdapterError> {
        self.gate().await?;
        Ok(self.items.get(id).map(|i| i.value().clone()))
    }

    async fn delete(&self, id: &ItemId) -> Result<(), AdapterError> {
        self.gate().await?;
        self.items.remove(id);
        Ok(())
    }

    async fn query(&self, fragment: &QueryFragment) -> Result<Vec<ScoredItem>, AdapterError> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;

        let mut results: Vec<ScoredItem> = Vec::new();
        for entry in self.items.iter() {
            let item = entry.value();
            if !fragment.filter.matches(item) {
                continue;
            }
            if let Some(score) = self.native_score(item, fragment) {
                results.push(ScoredItem::new(item.clone(), score));
            }
        }

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.item.id.cmp(&b.item.id))
        });
        if fragment.top_k > 0 {
            results.truncate(fragment.top_k);
        }
        Ok(results)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}
