//! # Models
//!
//! Data shapes shared by the cache, the mutation coordinator and the realtime
//! channel.
//!
//! - **`entity`**: cache entries, entity keys, merge patches and the optimistic
//!   mutation kinds.
//! - **`wire`**: the JSON envelope spoken over the realtime channel.

/// Cache entries, merge patches and mutation kinds.
pub mod entity;
/// The realtime wire protocol.
pub mod wire;

pub use entity::{merge_patch, CacheEntry, EntityKey, MutationKind};
pub use wire::{Alert, CounterUpdate, MessageKind, PriceUpdate, WireFrame, WireMessage};
