//! Error types for the lattice memory fabric

use thiserror::Error;

/// Errors surfaced by a store adapter.
///
/// `Unavailable` is transient and retriable; the other variants are not.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// The backend cannot be reached right now (network, disk, timeout)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the write due to its own uniqueness constraints
    #[error("Store-level conflict: {0}")]
    Conflict(String),

    /// The item or query fragment cannot be represented in this backend
    #[error("Malformed request: {0}")]
    Malformed(String),
}

/// Errors surfaced by the query router.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Every adapter in the fan-out set failed or timed out
    #[error("All backends unavailable for query")]
    AllBackendsUnavailable,

    /// The request references unknown stores, an empty store set, or an
    /// unrouted context tag
    #[error("Invalid query pattern: {0}")]
    InvalidPattern(String),
}

/// Errors surfaced by the synchronization manager.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No conflict is pending for the item, or resolution could not decide
    #[error("Unresolved conflict for item {0}")]
    UnresolvedConflict(String),

    /// Bounded retries were exhausted while applying a propagation
    #[error("Propagation attempts exhausted for item {0}")]
    AttemptsExhausted(String),
}

/// Main error type exposed by the memory manager facade.
#[derive(Error, Debug)]
pub enum ManagerError {
    /// The requested item is not tracked by the registry
    #[error("Item not found: {0}")]
    NotFound(String),

    /// Configuration errors (missing stores, bad home store, parse failures)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Adapter errors that escape the facade (home-store persist failures)
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// Query routing errors
    #[error(transparent)]
    Router(#[from] RouterError),

    /// Synchronization errors
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Result type alias for manager-facing operations
pub type Result<T> = std::result::Result<T, ManagerError>;
