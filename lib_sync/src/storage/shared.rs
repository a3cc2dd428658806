use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::listeners::{ListenerSet, Unsubscribe};
use crate::error::Result;
use crate::storage::KeyValueStore;
use crate::utils::lock;

/// A change made through one handle, delivered to every other handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// The changed key.
    pub key: String,
    /// Value before the change.
    pub old_value: Option<String>,
    /// Value after the change; `None` for deletions.
    pub new_value: Option<String>,
    /// Id of the handle that made the change.
    pub origin: u64,
}

struct Shared {
    data: Mutex<BTreeMap<String, String>>,
    events: ListenerSet<StorageEvent>,
    next_handle: AtomicU64,
}

/// The storage area shared by every tab of one origin.
#[derive(Clone)]
pub struct SharedStorage {
    shared: Arc<Shared>,
}

impl Default for SharedStorage {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                data: Mutex::new(BTreeMap::new()),
                events: ListenerSet::new(),
                next_handle: AtomicU64::new(1),
            }),
        }
    }
}

impl SharedStorage {
    /// Creates an empty storage area.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new handle; think of it as one tab.
    pub fn handle(&self) -> StorageHandle {
        StorageHandle {
            id: self.shared.next_handle.fetch_add(1, Ordering::Relaxed),
            shared: Arc::clone(&self.shared),
        }
    }
}

/// One tab's view of a [`SharedStorage`].
#[derive(Clone)]
pub struct StorageHandle {
    id: u64,
    shared: Arc<Shared>,
}

impl StorageHandle {
    /// This handle's id, as it appears in [`StorageEvent::origin`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Observes changes made through *other* handles. Like browser storage
    /// events, a handle never sees its own writes.
    pub fn observe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&StorageEvent) + Send + Sync + 'static,
    {
        let me = self.id;
        self.shared.events.add(move |event: &StorageEvent| {
            if event.origin != me {
                listener(event);
            }
        })
    }

    fn write(&self, key: &str, new_value: Option<String>) {
        let old_value = {
            let mut data = lock(&self.shared.data);
            match &new_value {
                Some(value) => data.insert(key.to_string(), value.clone()),
                None => data.remove(key),
            }
        };
        if old_value.is_none() && new_value.is_none() {
            return;
        }
        self.shared.events.emit(&StorageEvent {
            key: key.to_string(),
            old_value,
            new_value,
            origin: self.id,
        });
    }
}

impl KeyValueStore for StorageHandle {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.shared.data).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.write(key, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.write(key, None);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(lock(&self.shared.data).keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_handles_observe_writes_and_deletes() {
        let storage = SharedStorage::new();
        let tab1 = storage.handle();
        let tab2 = storage.handle();

        let seen1 = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::new(Mutex::new(Vec::new()));
        let _o1 = {
            let seen = Arc::clone(&seen1);
            tab1.observe(move |e| seen.lock().unwrap().push(e.clone()))
        };
        let _o2 = {
            let seen = Arc::clone(&seen2);
            tab2.observe(move |e| seen.lock().unwrap().push(e.clone()))
        };

        tab1.set("sync_a", "payload").unwrap();
        tab1.remove("sync_a").unwrap();

        assert!(seen1.lock().unwrap().is_empty());
        let events = seen2.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].new_value.as_deref(), Some("payload"));
        assert_eq!(events[1].new_value, None);
        assert_eq!(events[1].old_value.as_deref(), Some("payload"));
        assert_eq!(events[1].origin, tab1.id());
    }

    #[test]
    fn removing_missing_key_is_silent() {
        let storage = SharedStorage::new();
        let tab1 = storage.handle();
        let tab2 = storage.handle();
        let hits = Arc::new(Mutex::new(0));
        let _o = {
            let hits = Arc::clone(&hits);
            tab2.observe(move |_| *hits.lock().unwrap() += 1)
        };
        tab1.remove("nothing").unwrap();
        assert_eq!(*hits.lock().unwrap(), 0);
        assert!(tab2.keys().unwrap().is_empty());
    }
}
