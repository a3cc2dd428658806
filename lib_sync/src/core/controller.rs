//! # Realtime Sync Controller
//!
//! The top-level orchestrator: an explicitly constructed instance, owned by
//! the application's composition root, that feeds realtime frames and
//! cross-tab messages into the [`CacheStore`] and keeps the server-side
//! subscription set in step with what the application tracks.
//!
//! Realtime pushes and cross-tab patches are both authoritative: they land as
//! unconditional writes, so a pending optimistic rollback can never undo them.

use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};

use crate::core::cache_store::CacheStore;
use crate::core::cross_tab::CrossTabBus;
use crate::core::listeners::{ListenerSet, Unsubscribe};
use crate::core::mutation::MutationCoordinator;
use crate::error::SyncError;
use crate::ingestors::backoff::ConnectionStatus;
use crate::ingestors::realtime_wss::ReconnectingChannel;
use crate::model::entity::{EntityKey, MutationKind};
use crate::model::wire::{Alert, WireFrame, WireMessage};
use crate::utils::lock;

/// Cache entry mirroring the channel: `{"status", "connected", "attempt"}`.
pub const CONNECTION_STATUS_KEY: &str = "$connection";
/// Cache entry holding the latest `MARKET_STATUS` object.
pub const MARKET_STATUS_KEY: &str = "$market";

/// What a `track_entities` call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDiff {
    /// Newly tracked keys, sent as `SUBSCRIBE`.
    pub added: BTreeSet<EntityKey>,
    /// No longer tracked keys, sent as `UNSUBSCRIBE`.
    pub removed: BTreeSet<EntityKey>,
}

impl SubscriptionDiff {
    /// `true` when the tracked set did not change.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// # Realtime Sync Controller
///
/// `start()` wires everything and connects; `stop()` unwires and closes.
pub struct RealtimeSyncController {
    store: Arc<CacheStore<Value>>,
    channel: Arc<ReconnectingChannel>,
    bus: Option<Arc<CrossTabBus>>,
    coordinator: Option<Arc<MutationCoordinator>>,
    tracked: Arc<Mutex<BTreeSet<EntityKey>>>,
    alerts: ListenerSet<Alert>,
    wiring: Mutex<Vec<Unsubscribe>>,
}

impl RealtimeSyncController {
    /// Assembles a controller. Nothing is wired until [`start`](Self::start).
    pub fn new(store: Arc<CacheStore<Value>>, channel: Arc<ReconnectingChannel>, bus: Option<Arc<CrossTabBus>>) -> Self {
        Self {
            store,
            channel,
            bus,
            coordinator: None,
            tracked: Arc::new(Mutex::new(BTreeSet::new())),
            alerts: ListenerSet::new(),
            wiring: Mutex::new(Vec::new()),
        }
    }

    /// Exposes a mutation coordinator through [`mutations`](Self::mutations).
    pub fn with_mutations(mut self, coordinator: Arc<MutationCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Wires channel and bus listeners into the cache and connects the channel.
    ///
    /// Calling it again while started only reconnects a `FAILED` or closed channel.
    pub fn start(&self) {
        let mut wiring = lock(&self.wiring);
        if wiring.is_empty() {
            let tracked = Arc::clone(&self.tracked);
            self.channel.set_replay(move || {
                let symbols = lock(&tracked).clone();
                (!symbols.is_empty()).then_some(WireMessage::Subscribe(symbols))
            });

            let store = Arc::clone(&self.store);
            let alerts = self.alerts.clone();
            wiring.push(self.channel.on_message(move |frame| apply_frame(&store, &alerts, frame)));

            let store = Arc::clone(&self.store);
            let channel: Weak<ReconnectingChannel> = Arc::downgrade(&self.channel);
            wiring.push(self.channel.on_status_change(move |status| {
                let attempt = channel.upgrade().map(|c| c.reconnect_state().attempt).unwrap_or_default();
                mirror_status(&store, *status, attempt);
            }));

            if let Some(bus) = &self.bus {
                let store = Arc::clone(&self.store);
                wiring.push(bus.on_broadcast(move |message| {
                    apply_patch(&store, &message.entity_key, &message.patch);
                }));
            }
            log::info!("Realtime sync controller started");
        }
        drop(wiring);

        let state = self.channel.reconnect_state();
        mirror_status(&self.store, state.status, state.attempt);
        self.channel.connect();
    }

    /// Unwires every listener and closes the channel. Cached values stay.
    pub fn stop(&self) {
        for handle in lock(&self.wiring).drain(..) {
            handle.unsubscribe();
        }
        self.channel.close();
        let state = self.channel.reconnect_state();
        mirror_status(&self.store, state.status, state.attempt);
        log::info!("Realtime sync controller stopped");
    }

    /// [`stop`](Self::stop), then waits for the channel task to exit.
    pub async fn shutdown(&self) {
        self.stop();
        self.channel.shutdown().await;
    }

    /// Replaces the tracked set and sends the difference.
    ///
    /// While the channel is down the messages are skipped: the next OPEN
    /// replays the whole tracked set anyway.
    pub fn track_entities<I, K>(&self, keys: I) -> SubscriptionDiff
    where
        I: IntoIterator<Item = K>,
        K: Into<EntityKey>,
    {
        let next: BTreeSet<EntityKey> = keys.into_iter().map(Into::into).collect();
        let diff = {
            let mut tracked = lock(&self.tracked);
            let diff = SubscriptionDiff {
                added: next.difference(&tracked).cloned().collect(),
                removed: tracked.difference(&next).cloned().collect(),
            };
            *tracked = next;
            diff
        };

        if !diff.added.is_empty() {
            self.send_or_defer(WireMessage::Subscribe(diff.added.clone()));
        }
        if !diff.removed.is_empty() {
            self.send_or_defer(WireMessage::Unsubscribe(diff.removed.clone()));
        }
        diff
    }

    fn send_or_defer(&self, message: WireMessage) {
        let kind = message.kind();
        match self.channel.send(message) {
            Ok(()) => {}
            Err(SyncError::NotConnected) => log::debug!("{:?} deferred until the channel opens", kind),
            Err(e) => log::warn!("Could not send {:?}: {}", kind, e),
        }
    }

    /// Applies one inbound frame to the cache. The channel listener calls this
    /// for every frame; it is public for feeding frames from elsewhere.
    pub fn on_channel_message(&self, frame: &WireFrame) {
        apply_frame(&self.store, &self.alerts, frame);
    }

    /// Registers a listener for `ALERT` messages.
    pub fn on_alert<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.alerts.add(listener)
    }

    /// The currently tracked keys.
    pub fn tracked(&self) -> BTreeSet<EntityKey> {
        lock(&self.tracked).clone()
    }

    /// The mutation coordinator, if one was attached.
    pub fn mutations(&self) -> Option<&Arc<MutationCoordinator>> {
        self.coordinator.as_ref()
    }

    /// The cache this controller writes to.
    pub fn store(&self) -> &Arc<CacheStore<Value>> {
        &self.store
    }

    /// The realtime channel.
    pub fn channel(&self) -> &Arc<ReconnectingChannel> {
        &self.channel
    }
}

fn apply_frame(store: &CacheStore<Value>, alerts: &ListenerSet<Alert>, frame: &WireFrame) {
    match &frame.message {
        WireMessage::PriceUpdate(update) => {
            apply_patch(store, &update.symbol, &Value::Object(update.price.clone()));
        }
        WireMessage::CounterUpdate(update) => {
            apply_patch(store, &update.key, &Value::Object(update.counters.clone()));
        }
        WireMessage::MarketStatus(status) => {
            apply_patch(store, MARKET_STATUS_KEY, &Value::Object(status.clone()));
        }
        WireMessage::Alert(alert) => {
            log::info!("Realtime alert: {}", alert.message);
            alerts.emit(alert);
        }
        WireMessage::Subscribe(_) | WireMessage::Unsubscribe(_) => {
            log::debug!("Ignoring client-bound {:?} frame", frame.message.kind());
        }
    }
}

/// Unconditional merge: authoritative updates always win.
fn apply_patch(store: &CacheStore<Value>, key: &str, patch: &Value) {
    let kind = MutationKind::ApplyPatch(patch.clone());
    store.update(key, |current| kind.apply(current), None);
}

fn mirror_status(store: &CacheStore<Value>, status: ConnectionStatus, attempt: u32) {
    store.set(
        CONNECTION_STATUS_KEY,
        json!({
            "status": status,
            "connected": status.is_connected(),
            "attempt": attempt,
        }),
        None,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::config_sync::ChannelConfig;

    fn controller() -> RealtimeSyncController {
        let store = Arc::new(CacheStore::new());
        let channel = Arc::new(ReconnectingChannel::new(ChannelConfig::default()).unwrap());
        RealtimeSyncController::new(store, channel, None)
    }

    #[test]
    fn track_entities_reports_the_diff() {
        let controller = controller();
        let first = controller.track_entities(["AAPL", "MSFT"]);
        assert_eq!(first.added.len(), 2);
        assert!(first.removed.is_empty());

        let second = controller.track_entities(["MSFT", "TSLA"]);
        assert_eq!(second.added, BTreeSet::from(["TSLA".to_string()]));
        assert_eq!(second.removed, BTreeSet::from(["AAPL".to_string()]));

        assert!(controller.track_entities(["MSFT", "TSLA"]).is_empty());
        assert_eq!(controller.tracked().len(), 2);
    }

    #[test]
    fn price_updates_merge_unconditionally() {
        let controller = controller();
        controller.store().set("AAPL", json!({"last": 1.0, "name": "Apple"}), None);

        let frame = WireFrame::decode(
            r#"{"type":"PRICE_UPDATE","data":{"symbol":"AAPL","price":{"last":187.2}}}"#,
        )
        .unwrap();
        controller.on_channel_message(&frame);

        let entry = controller.store().get("AAPL").unwrap();
        assert_eq!(entry.value, json!({"last": 187.2, "name": "Apple"}));
        assert_eq!(entry.version, 2);
    }

    #[test]
    fn status_and_alerts_take_side_channels() {
        let controller = controller();
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let _h = {
            let alerts = Arc::clone(&alerts);
            controller.on_alert(move |a| alerts.lock().unwrap().push(a.message.clone()))
        };

        controller.on_channel_message(
            &WireFrame::decode(r#"{"type":"MARKET_STATUS","data":{"session":"REGULAR"}}"#).unwrap(),
        );
        controller.on_channel_message(
            &WireFrame::decode(r#"{"type":"ALERT","data":{"message":"halted","symbol":"XYZ"}}"#).unwrap(),
        );

        assert_eq!(
            controller.store().get(MARKET_STATUS_KEY).map(|e| e.value),
            Some(json!({"session": "REGULAR"}))
        );
        assert_eq!(*alerts.lock().unwrap(), vec!["halted".to_string()]);
        assert_eq!(controller.store().keys(), vec![MARKET_STATUS_KEY.to_string()]);
    }
}
