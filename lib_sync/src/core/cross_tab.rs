//! # Cross-Tab Bus
//!
//! Fans small sync messages out to the other tabs sharing a [`SharedStorage`]
//! origin. A broadcast writes a uniquely nonced message under
//! `sync_<entityKey>` and deletes it shortly after: the write reaches every
//! other tab as a storage event carrying the payload, the delete only keeps
//! the shared area from growing.
//!
//! Delivery order across tabs is whatever the storage notification gives us.
//! Cross-tab sync accelerates convergence; the realtime channel stays the
//! source of truth.
//!
//! [`SharedStorage`]: crate::storage::SharedStorage

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::configs::config_sync::CrossTabConfig;
use crate::core::listeners::{ListenerSet, Unsubscribe};
use crate::error::Result;
use crate::storage::{KeyValueStore, StorageEvent, StorageHandle};
use crate::utils::lock;
use crate::utils::time::{Clock, SystemClock};

const KEY_PREFIX: &str = "sync_";
/// How many of our own nonces we remember for self-dedupe.
const OWN_NONCE_MEMORY: usize = 256;

/// The payload stored under `sync_<entityKey>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossTabMessage {
    /// The entity the patch applies to.
    pub entity_key: String,
    /// JSON merge patch.
    pub patch: Value,
    /// Emission time, epoch milliseconds.
    #[serde(rename = "timestamp")]
    pub emitted_at: i64,
    /// Unique per broadcast.
    pub nonce: String,
}

/// # Cross-Tab Bus
pub struct CrossTabBus {
    storage: StorageHandle,
    config: CrossTabConfig,
    clock: Arc<dyn Clock>,
    listeners: ListenerSet<CrossTabMessage>,
    own_nonces: Arc<Mutex<VecDeque<String>>>,
    observer: Mutex<Option<Unsubscribe>>,
}

impl CrossTabBus {
    /// Attaches a bus to one tab's storage handle and starts observing it.
    pub fn new(storage: StorageHandle, config: CrossTabConfig) -> Arc<Self> {
        Self::with_clock(storage, config, Arc::new(SystemClock))
    }

    /// Same as [`new`](Self::new) with an explicit clock for `emitted_at`.
    pub fn with_clock(storage: StorageHandle, config: CrossTabConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let bus = Arc::new(Self {
            storage,
            config,
            clock,
            listeners: ListenerSet::new(),
            own_nonces: Arc::new(Mutex::new(VecDeque::new())),
            observer: Mutex::new(None),
        });

        let listeners = bus.listeners.clone();
        let own_nonces = Arc::clone(&bus.own_nonces);
        let observer = bus.storage.observe(move |event| {
            dispatch_storage_event(event, &listeners, &own_nonces);
        });
        *lock(&bus.observer) = Some(observer);
        bus
    }

    /// Storage key for an entity.
    pub fn storage_key(entity_key: &str) -> String {
        format!("{}{}", KEY_PREFIX, entity_key)
    }

    /// Publishes `patch` for `entity_key` to the other tabs.
    ///
    /// The pulse is removed after the configured cleanup delay. Outside a
    /// Tokio runtime it is removed immediately, which still delivers it since
    /// observers run synchronously on the write.
    pub fn broadcast(&self, entity_key: &str, patch: Value) -> Result<CrossTabMessage> {
        let message = CrossTabMessage {
            entity_key: entity_key.to_string(),
            patch,
            emitted_at: self.clock.now_ms(),
            nonce: uuid::Uuid::new_v4().to_string(),
        };
        let key = Self::storage_key(entity_key);
        let payload = serde_json::to_string(&message)?;

        {
            let mut own = lock(&self.own_nonces);
            own.push_back(message.nonce.clone());
            while own.len() > OWN_NONCE_MEMORY {
                own.pop_front();
            }
        }
        self.storage.set(&key, &payload)?;
        log::debug!("Cross-tab pulse {} for {}", message.nonce, entity_key);

        self.schedule_cleanup(key, message.nonce.clone());
        Ok(message)
    }

    fn schedule_cleanup(&self, key: String, nonce: String) {
        let storage = self.storage.clone();
        let delay = self.config.cleanup_delay();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    remove_if_ours(&storage, &key, &nonce);
                });
            }
            Err(_) => remove_if_ours(&storage, &key, &nonce),
        }
    }

    /// Registers a listener for messages broadcast by other tabs.
    pub fn on_broadcast<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&CrossTabMessage) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    /// Stops observing storage. Listeners stay registered but will not fire again.
    pub fn detach(&self) {
        if let Some(observer) = lock(&self.observer).take() {
            observer.unsubscribe();
        }
    }

    /// How long pulses stay in storage.
    pub fn cleanup_delay(&self) -> Duration {
        self.config.cleanup_delay()
    }
}

impl Drop for CrossTabBus {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Only the write carries a payload; deletions and foreign keys are ignored.
fn dispatch_storage_event(
    event: &StorageEvent,
    listeners: &ListenerSet<CrossTabMessage>,
    own_nonces: &Mutex<VecDeque<String>>,
) {
    if !event.key.starts_with(KEY_PREFIX) {
        return;
    }
    let Some(raw) = event.new_value.as_deref().filter(|raw| !raw.is_empty()) else {
        return;
    };
    let message = match serde_json::from_str::<CrossTabMessage>(raw) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Dropping malformed cross-tab message under {}: {}", event.key, e);
            return;
        }
    };
    if lock(own_nonces).contains(&message.nonce) {
        return;
    }
    listeners.emit(&message);
}

/// Deletes the pulse unless a newer broadcast for the same key replaced it.
fn remove_if_ours(storage: &StorageHandle, key: &str, nonce: &str) {
    let current = match storage.get(key) {
        Ok(current) => current,
        Err(e) => {
            log::warn!("Cross-tab cleanup read failed for {}: {}", key, e);
            return;
        }
    };
    let ours = current
        .as_deref()
        .and_then(|raw| serde_json::from_str::<CrossTabMessage>(raw).ok())
        .is_some_and(|message| message.nonce == nonce);
    if ours {
        if let Err(e) = storage.remove(key) {
            log::warn!("Cross-tab cleanup failed for {}: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SharedStorage;
    use serde_json::json;

    fn collect(bus: &CrossTabBus) -> (Arc<Mutex<Vec<CrossTabMessage>>>, Unsubscribe) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let seen = Arc::clone(&seen);
            bus.on_broadcast(move |m| seen.lock().unwrap().push(m.clone()))
        };
        (seen, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_reaches_other_tab_and_is_cleaned_up() {
        let storage = SharedStorage::new();
        let tab1 = CrossTabBus::new(storage.handle(), CrossTabConfig::default());
        let tab2 = CrossTabBus::new(storage.handle(), CrossTabConfig::default());
        let (seen1, _h1) = collect(&tab1);
        let (seen2, _h2) = collect(&tab2);

        let sent = tab1.broadcast("post:42", json!({"viewCount": 11})).unwrap();

        assert!(seen1.lock().unwrap().is_empty(), "sender must not hear itself");
        assert_eq!(*seen2.lock().unwrap(), vec![sent]);
        assert_eq!(storage.handle().keys().unwrap(), vec!["sync_post:42".to_string()]);

        tokio::time::sleep(tab1.cleanup_delay() + Duration::from_millis(1)).await;
        assert!(storage.handle().keys().unwrap().is_empty());
        assert_eq!(seen2.lock().unwrap().len(), 1, "the delete is not dispatched");
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_spares_a_newer_pulse() {
        let storage = SharedStorage::new();
        let config = CrossTabConfig { cleanup_delay_ms: 100 };
        let tab1 = CrossTabBus::new(storage.handle(), config.clone());

        tab1.broadcast("AAPL", json!({"last": 1})).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = tab1.broadcast("AAPL", json!({"last": 2})).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let raw = storage.handle().get("sync_AAPL").unwrap().expect("second pulse still present");
        assert!(raw.contains(&second.nonce));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(storage.handle().get("sync_AAPL").unwrap().is_none());
    }

    #[test]
    fn own_nonce_is_ignored_even_if_echoed() {
        let storage = SharedStorage::new();
        let tab1 = CrossTabBus::new(storage.handle(), CrossTabConfig::default());
        let (seen1, _h) = collect(&tab1);
        let sent = tab1.broadcast("k", json!({"a": 1})).unwrap();

        // Another handle replays the exact payload, as an echoing platform would.
        let echo = storage.handle();
        echo.set("sync_k", &serde_json::to_string(&sent).unwrap()).unwrap();
        assert!(seen1.lock().unwrap().is_empty());
    }

    #[test]
    fn malformed_and_foreign_keys_are_ignored() {
        let storage = SharedStorage::new();
        let tab1 = CrossTabBus::new(storage.handle(), CrossTabConfig::default());
        let (seen1, _h) = collect(&tab1);
        let other = storage.handle();
        other.set("sync_k", "{broken").unwrap();
        other.set("cooldown_k@u1", r#"{"lastActionAt":1}"#).unwrap();
        assert!(seen1.lock().unwrap().is_empty());
    }
}
