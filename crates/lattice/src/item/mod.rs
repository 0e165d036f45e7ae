//! Memory item types and lifecycle helpers
//!
//! Defines the logical memory item shared by every backend store,
//! including tombstone and phase-tag metadata conventions.

pub mod types;

pub use types::{Content, ItemId, ItemType, MemoryItem, Payload, PHASE_KEY, TOMBSTONE_KEY};
