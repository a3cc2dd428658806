//! # lib_sync
//!
//! A client-resident realtime cache synchronization core. It keeps a local,
//! optimistically mutated view of server-owned entities consistent across
//! user-initiated writes, server-pushed realtime events and other tabs sharing
//! the same storage origin.
//!
//! The pieces, leaf first:
//! - [`core::CacheStore`]: keyed snapshots with per-key versions and listeners.
//! - [`core::CooldownLedger`]: durable per-viewer dedup windows.
//! - [`core::CrossTabBus`]: write-then-delete broadcast pulses over shared storage.
//! - [`ingestors::ReconnectingChannel`]: a WebSocket link with backoff and replay.
//! - [`core::MutationCoordinator`]: optimistic writes, confirmation and rollback.
//! - [`core::RealtimeSyncController`]: wires the channel and the bus into the cache.

#![doc(html_logo_url = "https://example.com/logo.png")] // Placeholder
#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Error taxonomy shared by every module.
pub mod error;
/// Cache, cooldowns, cross-tab bus, mutations, derived views and the controller.
pub mod core;
/// Entity and wire-protocol models.
pub mod model;
/// Key-value storage backends (shared, file-backed).
pub mod storage;
/// Typed configuration with defaults.
pub mod configs;
/// Clocks and timestamp helpers.
pub mod utils;
/// Network-facing components.
#[cfg(feature = "channel")]
pub mod ingestors;

// --- Public API Re-exports ---
pub use error::{Result, SyncError};
pub use model::entity::{CacheEntry, EntityKey, MutationKind};
pub use configs::config_sync::{ChannelConfig, CooldownConfig, CrossTabConfig, SyncConfig};
