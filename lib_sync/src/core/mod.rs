//! # Core Sync Modules
//!
//! The state-owning half of the sync core. Everything here is runtime-agnostic
//! except the mutation coordinator, which settles remote calls on Tokio tasks,
//! and the controller, which needs the realtime channel.
//!
//! ## Contained Modules:
//! - **`listeners`**: explicit listener registration with unsubscribe handles.
//! - **`cache_store`**: versioned entity snapshots, the single source of truth.
//! - **`cooldown`**: durable per-viewer dedup windows.
//! - **`cross_tab`**: write-then-delete broadcast pulses between tabs.
//! - **`mutation`**: optimistic writes with guarded rollback.
//! - **`derived`**: values recomputed from a fixed set of entries.
//! - **`controller`**: feeds realtime and cross-tab traffic into the cache.

/// Listener sets and unsubscribe handles.
pub mod listeners;
/// The versioned cache.
pub mod cache_store;
/// Time-windowed action dedup.
pub mod cooldown;
/// Cross-tab fan-out over shared storage.
pub mod cross_tab;
/// Optimistic mutation orchestration.
pub mod mutation;
/// Derived values over cache entries.
pub mod derived;
/// The realtime sync controller.
#[cfg(feature = "channel")]
pub mod controller;

// --- Public API Re-exports ---
pub use cache_store::{CacheChange, CacheStore, SetOutcome};
pub use cooldown::{CooldownLedger, CooldownRecord};
pub use cross_tab::{CrossTabBus, CrossTabMessage};
pub use derived::DerivedView;
pub use listeners::{Listener, ListenerSet, Unsubscribe};
pub use mutation::{
    MutationCoordinator, MutationHandle, MutationOutcome, MutationRequest, PendingMutation, RemoteError,
    RemoteResult,
};
#[cfg(feature = "channel")]
pub use controller::{RealtimeSyncController, CONNECTION_STATUS_KEY, MARKET_STATUS_KEY};
