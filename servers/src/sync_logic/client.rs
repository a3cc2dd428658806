use anyhow::{Context, Result};
use lib_sync::core::{
    CacheChange, CacheStore, CooldownLedger, CrossTabBus, DerivedView, MutationCoordinator, RealtimeSyncController,
    Unsubscribe, CONNECTION_STATUS_KEY, MARKET_STATUS_KEY,
};
use lib_sync::ingestors::ReconnectingChannel;
use lib_sync::storage::{FileStorage, KeyValueStore, SharedStorage};
use lib_sync::{CacheEntry, SyncConfig};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How often expired cooldown records are swept from disk.
const COOLDOWN_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// The composition root: owns every sync component for one process.
pub struct SyncClient {
    store: Arc<CacheStore<Value>>,
    ledger: Arc<CooldownLedger>,
    controller: RealtimeSyncController,
    quotes: DerivedView<usize>,
    watchers: Vec<Unsubscribe>,
}

impl SyncClient {
    pub fn build(config: &SyncConfig, cooldown_path: &Path) -> Result<Self> {
        let store: Arc<CacheStore<Value>> = Arc::new(CacheStore::new());

        let durable: Arc<dyn KeyValueStore> = Arc::new(
            FileStorage::open(cooldown_path)
                .with_context(|| format!("opening cooldown store {}", cooldown_path.display()))?,
        );
        let ledger = Arc::new(CooldownLedger::new(durable, &config.cooldown));

        // A single process is a single tab; the bus still carries confirmed
        // mutations to any other handle opened on the same storage.
        let bus = CrossTabBus::new(SharedStorage::new().handle(), config.cross_tab.clone());

        let coordinator = Arc::new(
            MutationCoordinator::new(Arc::clone(&store))
                .with_ledger(Arc::clone(&ledger))
                .with_cross_tab(Arc::clone(&bus)),
        );
        let channel = Arc::new(ReconnectingChannel::new(config.channel.clone())?);
        let controller =
            RealtimeSyncController::new(Arc::clone(&store), channel, Some(bus)).with_mutations(coordinator);

        let mut watchers = Vec::new();
        watchers.push(store.subscribe(CONNECTION_STATUS_KEY, |change| {
            if let CacheChange::Updated(entry) = change {
                log::info!("Connection: {}", entry.value);
            }
        }));
        watchers.push(store.subscribe(MARKET_STATUS_KEY, |change| {
            if let CacheChange::Updated(entry) = change {
                log::info!("Market status: {}", entry.value);
            }
        }));
        watchers.push(controller.on_alert(|alert| {
            log::warn!(
                "ALERT [{}] {}: {}",
                alert.severity.as_deref().unwrap_or("info"),
                alert.symbol.as_deref().unwrap_or("-"),
                alert.message
            );
        }));

        Ok(Self {
            quotes: DerivedView::new(&store, Vec::<String>::new(), count_quoted),
            store,
            ledger,
            controller,
            watchers,
        })
    }

    /// Tracks `symbols`, logs their updates and connects.
    pub fn start(&mut self, symbols: &[String]) {
        match self.ledger.purge_expired() {
            Ok(purged) if purged > 0 => log::info!("Purged {} expired cooldown records", purged),
            Ok(_) => {}
            Err(e) => log::warn!("Cooldown purge failed: {}", e),
        }

        for symbol in symbols {
            self.watchers.push(self.store.subscribe(symbol, |change| match change {
                CacheChange::Updated(entry) => log::info!("{} v{} {}", entry.key, entry.version, entry.value),
                CacheChange::Removed { key, .. } => log::info!("{} removed", key),
            }));
        }

        self.quotes = DerivedView::new(&self.store, symbols.to_vec(), count_quoted);
        let total = symbols.len();
        self.watchers.push(self.quotes.on_change(move |quoted| {
            log::debug!("{}/{} tracked symbols have a price", quoted, total);
        }));

        let diff = self.controller.track_entities(symbols.iter().cloned());
        log::info!("Tracking {} entities ({} new)", self.controller.tracked().len(), diff.added.len());
        self.controller.start();
    }

    /// Sweeps expired cooldown records on a fixed interval until the task is dropped.
    pub fn spawn_cooldown_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let ledger = Arc::clone(&self.ledger);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(COOLDOWN_PURGE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = ledger.purge_expired() {
                    log::warn!("Cooldown purge failed: {}", e);
                }
            }
        })
    }

    pub async fn shutdown(mut self) {
        for watcher in self.watchers.drain(..) {
            watcher.unsubscribe();
        }
        self.controller.shutdown().await;
        log::info!(
            "Sync client stopped with {} cached entities, {} mutations pending",
            self.store.len(),
            self.controller.mutations().map(|m| m.pending().len()).unwrap_or_default()
        );
    }
}

fn count_quoted(entries: &[Option<CacheEntry<Value>>]) -> usize {
    entries
        .iter()
        .flatten()
        .filter(|entry| entry.value.get("last").is_some_and(Value::is_number))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_quoted_ignores_missing_and_unpriced() {
        let store: Arc<CacheStore<Value>> = Arc::new(CacheStore::new());
        store.set("AAPL", serde_json::json!({"last": 1.5}), None);
        store.set("MSFT", serde_json::json!({"name": "Microsoft"}), None);
        let view = DerivedView::new(&store, ["AAPL", "MSFT", "TSLA"], count_quoted);
        assert_eq!(view.get(), 1);
        store.set("TSLA", serde_json::json!({"last": 200}), None);
        assert_eq!(view.get(), 2);
    }

    #[tokio::test]
    async fn builds_and_shuts_down_without_a_feed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::default();
        config.channel.url = "ws://127.0.0.1:9/ws".to_string();

        let mut client = SyncClient::build(&config, &dir.path().join("cooldowns.json")).unwrap();
        client.start(&["AAPL".to_string()]);
        assert_eq!(client.controller.tracked().len(), 1);
        client.shutdown().await;
    }
}
