//! # Utilities Module
//!
//! General-purpose helpers shared across `lib_sync`: the injectable [`Clock`]
//! used by time-windowed components, and timestamp formatting.

/// Clocks and epoch-millisecond helpers.
pub mod time;

pub use time::{Clock, ManualClock, SystemClock};

use std::sync::{Mutex, MutexGuard};

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// The data behind every lock in this crate stays structurally valid between
/// statements, so a poisoned lock is safe to keep using.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
