//! # Storage Module
//!
//! String key-value backends used by the sync core.
//!
//! - **`shared`**: [`SharedStorage`], an in-process model of same-origin
//!   storage shared by several tabs. Each tab works through its own
//!   [`StorageHandle`] and observes changes made by the *other* handles.
//! - **`file`**: [`FileStorage`], a durable JSON-file map that survives
//!   restarts. The cooldown ledger lives here in production.

/// Observable multi-handle storage.
pub mod shared;
/// Durable JSON-file storage.
pub mod file;

pub use file::FileStorage;
pub use shared::{SharedStorage, StorageEvent, StorageHandle};

use crate::error::Result;

/// Minimal string key-value contract shared by all backends.
///
/// Each call is atomic with respect to its key.
pub trait KeyValueStore: Send + Sync {
    /// Reads `key`.
    fn get(&self, key: &str) -> Result<Option<String>>;
    /// Writes `value` under `key`.
    fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Deletes `key`; missing keys are not an error.
    fn remove(&self, key: &str) -> Result<()>;
    /// All keys, sorted.
    fn keys(&self) -> Result<Vec<String>>;
}
