//! # Cache Store
//!
//! In-memory keyed store of entity snapshots. Each key carries a monotonic
//! version that is bumped on every applied write; writers that pass an
//! `expected_version` are rejected when the key has already moved past it.
//! That guard is what keeps an optimistic rollback from undoing a later,
//! authoritative update.
//!
//! Listeners registered for a key are notified after every applied mutation,
//! in registration order. Notifications for the whole store are delivered one
//! at a time, in the order the versions were assigned: whichever writer finds
//! the dispatch queue idle drains it, and writers that arrive meanwhile only
//! enqueue. A write made from inside a listener is therefore delivered after
//! the current notification completes. No I/O happens here.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;

use crate::core::listeners::{ListenerSet, Unsubscribe};
use crate::model::entity::{CacheEntry, EntityKey};
use crate::utils::lock;

/// What a key listener is told after a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheChange<T> {
    /// The key now holds this entry.
    Updated(CacheEntry<T>),
    /// The key was removed; `version` is the tombstone version.
    Removed {
        /// The removed key.
        key: EntityKey,
        /// Version assigned to the removal.
        version: u64,
    },
}

impl<T> CacheChange<T> {
    /// The affected key.
    pub fn key(&self) -> &str {
        match self {
            CacheChange::Updated(entry) => &entry.key,
            CacheChange::Removed { key, .. } => key,
        }
    }

    /// The version after the change.
    pub fn version(&self) -> u64 {
        match self {
            CacheChange::Updated(entry) => entry.version,
            CacheChange::Removed { version, .. } => *version,
        }
    }
}

/// Result of a `set`/`update` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SetOutcome<T> {
    /// `false` when the version guard rejected the write.
    pub applied: bool,
    /// The entry as it stands after the call (the rejected write is not reflected).
    pub entry: Option<CacheEntry<T>>,
}

struct Slot<T> {
    /// `None` after a removal; the version survives so it stays monotonic.
    entry: Option<CacheEntry<T>>,
    version: u64,
}

type Pending<T> = (ListenerSet<CacheChange<T>>, CacheChange<T>);

struct Inner<T> {
    slots: HashMap<EntityKey, Slot<T>>,
    listeners: HashMap<EntityKey, ListenerSet<CacheChange<T>>>,
    /// Notifications not yet delivered, in version order.
    pending: VecDeque<Pending<T>>,
    /// Set while some writer is draining `pending`.
    dispatching: bool,
}

/// # Cache Store
///
/// Shared via `Arc<CacheStore<T>>`. All access goes through `get`/`set`/
/// `update`/`remove`; no other component reaches into its state.
pub struct CacheStore<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Default for CacheStore<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                slots: HashMap::new(),
                listeners: HashMap::new(),
                pending: VecDeque::new(),
                dispatching: false,
            })),
        }
    }
}

/// Clears the dispatch flag if a listener panics mid-drain.
struct DispatchGuard<'a, T> {
    inner: &'a Mutex<Inner<T>>,
    finished: bool,
}

impl<T> Drop for DispatchGuard<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            lock(self.inner).dispatching = false;
        }
    }
}

impl<T> CacheStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current entry for `key`, if present.
    pub fn get(&self, key: &str) -> Option<CacheEntry<T>> {
        lock(&self.inner).slots.get(key).and_then(|slot| slot.entry.clone())
    }

    /// Current version of `key`, including tombstones; 0 for never-seen keys.
    pub fn version(&self, key: &str) -> u64 {
        lock(&self.inner).slots.get(key).map(|slot| slot.version).unwrap_or(0)
    }

    /// Writes `value`.
    ///
    /// Without `expected_version` the write is unconditional. With it, the
    /// write is rejected (`applied == false`) if the key's version is already
    /// newer than `expected_version`.
    pub fn set(&self, key: &str, value: T, expected_version: Option<u64>) -> SetOutcome<T> {
        self.update(key, move |_| value, expected_version)
    }

    /// Atomic read-modify-write: `f` receives the current value (if any) and
    /// returns the next one. Same guard and notification rules as [`set`](Self::set).
    pub fn update<F>(&self, key: &str, f: F, expected_version: Option<u64>) -> SetOutcome<T>
    where
        F: FnOnce(Option<&T>) -> T,
    {
        let outcome = {
            let mut inner = lock(&self.inner);
            let slot = inner.slots.entry(key.to_string()).or_insert(Slot { entry: None, version: 0 });

            if expected_version.is_some_and(|expected| slot.version > expected) {
                let outcome = SetOutcome { applied: false, entry: slot.entry.clone() };
                return outcome;
            }

            let next = f(slot.entry.as_ref().map(|entry| &entry.value));
            slot.version += 1;
            let entry = CacheEntry {
                key: key.to_string(),
                value: next,
                version: slot.version,
                last_updated_at: Utc::now(),
            };
            slot.entry = Some(entry.clone());

            if let Some(listeners) = inner.listeners.get(key).cloned() {
                inner.pending.push_back((listeners, CacheChange::Updated(entry.clone())));
            }
            SetOutcome { applied: true, entry: Some(entry) }
        };

        self.dispatch();
        outcome
    }

    /// Removes `key`, subject to the same version guard as `set`.
    ///
    /// Returns `true` if an entry was removed. The key's version is bumped so a
    /// later re-creation continues the sequence.
    pub fn remove(&self, key: &str, expected_version: Option<u64>) -> bool {
        {
            let mut inner = lock(&self.inner);
            let Some(slot) = inner.slots.get_mut(key) else {
                return false;
            };
            if slot.entry.is_none() || expected_version.is_some_and(|expected| slot.version > expected) {
                return false;
            }
            slot.entry = None;
            slot.version += 1;
            let version = slot.version;
            if let Some(listeners) = inner.listeners.get(key).cloned() {
                inner.pending.push_back((listeners, CacheChange::Removed { key: key.to_string(), version }));
            }
        }

        self.dispatch();
        true
    }

    /// Registers `listener` for changes to `key`.
    ///
    /// Once the last listener of a key unsubscribes, the key's listener set
    /// is dropped.
    pub fn subscribe<F>(&self, key: &str, listener: F) -> Unsubscribe
    where
        F: Fn(&CacheChange<T>) + Send + Sync + 'static,
    {
        // Registered under the store lock so a concurrent prune cannot orphan the set.
        let handle = lock(&self.inner)
            .listeners
            .entry(key.to_string())
            .or_default()
            .add(listener);

        let inner: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        let key = key.to_string();
        Unsubscribe::new(move || {
            handle.unsubscribe();
            if let Some(inner) = inner.upgrade() {
                let mut inner = lock(&inner);
                if inner.listeners.get(&key).is_some_and(|set| set.is_empty()) {
                    inner.listeners.remove(&key);
                }
            }
        })
    }

    /// Delivers queued notifications unless another writer already is.
    fn dispatch(&self) {
        {
            let mut inner = lock(&self.inner);
            if inner.dispatching || inner.pending.is_empty() {
                return;
            }
            inner.dispatching = true;
        }

        let mut guard = DispatchGuard { inner: &self.inner, finished: false };
        loop {
            let next = {
                let mut inner = lock(&self.inner);
                match inner.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        inner.dispatching = false;
                        guard.finished = true;
                        return;
                    }
                }
            };
            let (listeners, change) = next;
            listeners.emit(&change);
        }
    }

    /// Keys that currently hold a value.
    pub fn keys(&self) -> Vec<EntityKey> {
        let inner = lock(&self.inner);
        let mut keys: Vec<EntityKey> = inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of keys that currently hold a value.
    pub fn len(&self) -> usize {
        lock(&self.inner).slots.values().filter(|slot| slot.entry.is_some()).count()
    }

    /// `true` when no key holds a value.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
