//! Configuration for the lattice memory fabric
//!
//! Configuration is consumed, not discovered: an external loader supplies
//! the store descriptors and tuning knobs at startup, typically parsed
//! from TOML.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::ManagerError;
use crate::store::{StoreDescriptor, StoreId};

/// Top-level configuration for a memory manager instance.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryConfig {
    /// Descriptors for every configured backend store
    #[serde(default)]
    pub stores: Vec<StoreDescriptor>,
    /// Store that receives writes synchronously; defaults to the most
    /// preferred structured store
    #[serde(default)]
    pub home_store: Option<StoreId>,
    /// Synchronization manager tuning
    #[serde(default)]
    pub sync: SyncConfig,
    /// Query router tuning
    #[serde(default)]
    pub query: QueryConfig,
}

impl MemoryConfig {
    /// Parse a configuration document from TOML.
    pub fn from_toml_str(input: &str) -> Result<Self, ManagerError> {
        toml::from_str(input).map_err(|e| ManagerError::Config(e.to_string()))
    }
}

/// Synchronization manager configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Worker pool size for propagation tasks
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum delivery attempts per target before marking it failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff, in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay, in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    50
}

fn default_backoff_cap_ms() -> u64 {
    5_000
}

/// Query router configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Per-adapter call timeout, in milliseconds; an adapter exceeding it
    /// is treated as unavailable for that call
    #[serde(default = "default_adapter_timeout_ms")]
    pub adapter_timeout_ms: u64,
    /// Result limit applied when a request asks for `top_k = 0`
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    /// Capacity of the routed-query result cache
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// Context tag to preferred-store routing table for context-aware
    /// queries (e.g. reasoning phase -> stores)
    #[serde(default)]
    pub context_routes: BTreeMap<String, Vec<StoreId>>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            adapter_timeout_ms: default_adapter_timeout_ms(),
            default_top_k: default_top_k(),
            cache_size: default_cache_size(),
            context_routes: BTreeMap::new(),
        }
    }
}

fn default_adapter_timeout_ms() -> u64 {
    2_000
}

fn default_top_k() -> usize {
    10
}

fn default_cache_size() -> usize {
    64
}
