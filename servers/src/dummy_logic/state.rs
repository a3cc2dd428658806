use lib_sync::model::{Alert, CounterUpdate, PriceUpdate, WireMessage};
use rand::Rng;
use serde_json::{Map, Value, json};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};

/// Keys with this prefix get `COUNTER_UPDATE`s instead of prices.
pub const COUNTER_PREFIX: &str = "post:";

/// One generated frame; `key` is `None` for messages every client receives.
#[derive(Debug, Clone)]
pub struct FeedUpdate {
    pub key: Option<String>,
    pub text: String,
}

#[derive(Clone)]
pub struct AppState {
    // Map of client_id -> Set of subscribed keys
    client_subscriptions: Arc<Mutex<HashMap<usize, BTreeSet<String>>>>,
    // Last generated price per symbol
    prices: Arc<Mutex<HashMap<String, f64>>>,
    // Last generated view count per content key
    counters: Arc<Mutex<HashMap<String, u64>>>,
    // Channel to broadcast generated frames to all clients
    pub data_tx: broadcast::Sender<Arc<FeedUpdate>>,
}

impl AppState {
    pub fn new() -> Self {
        let (data_tx, _) = broadcast::channel(1000);
        Self {
            client_subscriptions: Arc::new(Mutex::new(HashMap::new())),
            prices: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Mutex::new(HashMap::new())),
            data_tx,
        }
    }

    pub async fn add_client(&self, client_id: usize) {
        self.client_subscriptions.lock().await.insert(client_id, BTreeSet::new());
    }

    pub async fn remove_client(&self, client_id: usize) {
        self.client_subscriptions.lock().await.remove(&client_id);
    }

    /// Returns the keys that were not already subscribed.
    pub async fn subscribe(&self, client_id: usize, keys: BTreeSet<String>) -> Vec<String> {
        let mut subs = self.client_subscriptions.lock().await;
        match subs.get_mut(&client_id) {
            Some(client_subs) => keys.into_iter().filter(|key| client_subs.insert(key.clone())).collect(),
            None => Vec::new(),
        }
    }

    pub async fn unsubscribe(&self, client_id: usize, keys: BTreeSet<String>) {
        if let Some(client_subs) = self.client_subscriptions.lock().await.get_mut(&client_id) {
            for key in keys {
                client_subs.remove(&key);
            }
        }
    }

    pub async fn is_subscribed(&self, client_id: usize, key: &str) -> bool {
        self.client_subscriptions
            .lock()
            .await
            .get(&client_id)
            .is_some_and(|subs| subs.contains(key))
    }

    pub async fn client_count(&self) -> usize {
        self.client_subscriptions.lock().await.len()
    }

    /// Union of every client's subscriptions.
    pub async fn subscribed_keys(&self) -> BTreeSet<String> {
        self.client_subscriptions.lock().await.values().flatten().cloned().collect()
    }

    /// Current snapshot for `key`, if one has been generated.
    pub async fn snapshot(&self, key: &str) -> Option<WireMessage> {
        if key.starts_with(COUNTER_PREFIX) {
            let counters = self.counters.lock().await;
            counters.get(key).map(|count| counter_message(key, *count))
        } else {
            let prices = self.prices.lock().await;
            prices.get(key).map(|last| price_message(key, *last, 0.0))
        }
    }

    /// Advances every subscribed key by one step and returns the resulting frames.
    pub async fn tick(&self, alert_probability: f64) -> Vec<FeedUpdate> {
        let keys = self.subscribed_keys().await;
        let mut prices = self.prices.lock().await;
        let mut counters = self.counters.lock().await;
        let mut rng = rand::rng();
        step(&keys, &mut prices, &mut counters, alert_probability, &mut rng)
    }
}

fn price_message(symbol: &str, last: f64, change: f64) -> WireMessage {
    let mut price = Map::new();
    price.insert("last".to_string(), json!(last));
    price.insert("change".to_string(), json!(change));
    WireMessage::PriceUpdate(PriceUpdate { symbol: symbol.to_string(), price })
}

fn counter_message(key: &str, count: u64) -> WireMessage {
    let mut counters = Map::new();
    counters.insert("viewCount".to_string(), Value::from(count));
    WireMessage::CounterUpdate(CounterUpdate { key: key.to_string(), counters })
}

fn to_update(key: Option<&str>, message: WireMessage) -> Option<FeedUpdate> {
    match message.into_frame().encode() {
        Ok(text) => Some(FeedUpdate { key: key.map(str::to_string), text }),
        Err(e) => {
            log::error!("Failed to encode generated frame: {}", e);
            None
        }
    }
}

/// One round of synthetic data: a bounded random walk per symbol, a few new
/// views per content key and, now and then, an alert.
pub fn step<R: Rng>(
    keys: &BTreeSet<String>,
    prices: &mut HashMap<String, f64>,
    counters: &mut HashMap<String, u64>,
    alert_probability: f64,
    rng: &mut R,
) -> Vec<FeedUpdate> {
    let mut updates = Vec::new();

    for key in keys {
        let message = if key.starts_with(COUNTER_PREFIX) {
            let count = counters.entry(key.clone()).or_insert(0);
            *count += rng.random_range(0..3u64);
            counter_message(key, *count)
        } else {
            let last = prices.entry(key.clone()).or_insert_with(|| rng.random_range(50.0..500.0));
            let change = (*last * rng.random_range(-0.005..0.005) * 100.0).round() / 100.0;
            *last = ((*last + change).max(0.01) * 100.0).round() / 100.0;
            price_message(key, *last, change)
        };
        updates.extend(to_update(Some(key), message));
    }

    let symbols: Vec<&String> = keys.iter().filter(|k| !k.starts_with(COUNTER_PREFIX)).collect();
    if !symbols.is_empty() && rng.random_bool(alert_probability) {
        let symbol = symbols[rng.random_range(0..symbols.len())];
        let alert = Alert {
            symbol: Some(symbol.clone()),
            message: format!("Unusual volume in {}", symbol),
            severity: Some("warning".to_string()),
        };
        updates.extend(to_update(None, WireMessage::Alert(alert)));
    }

    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_sync::model::WireFrame;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn keys(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn step_emits_one_frame_per_key_in_the_right_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut prices = HashMap::new();
        let mut counters = HashMap::new();

        let updates = step(&keys(&["AAPL", "post:1"]), &mut prices, &mut counters, 0.0, &mut rng);
        assert_eq!(updates.len(), 2);

        let aapl = updates.iter().find(|u| u.key.as_deref() == Some("AAPL")).unwrap();
        match WireFrame::decode(&aapl.text).unwrap().message {
            WireMessage::PriceUpdate(update) => {
                assert_eq!(update.symbol, "AAPL");
                assert!(update.price["last"].as_f64().unwrap() > 0.0);
            }
            other => panic!("unexpected {:?}", other),
        }

        let post = updates.iter().find(|u| u.key.as_deref() == Some("post:1")).unwrap();
        assert!(matches!(WireFrame::decode(&post.text).unwrap().message, WireMessage::CounterUpdate(_)));
        assert!(prices.contains_key("AAPL"));
        assert!(!prices.contains_key("post:1"));
    }

    #[test]
    fn certain_alert_goes_to_everyone() {
        let mut rng = StdRng::seed_from_u64(1);
        let updates = step(&keys(&["MSFT"]), &mut HashMap::new(), &mut HashMap::new(), 1.0, &mut rng);
        let alert = updates.iter().find(|u| u.key.is_none()).expect("alert frame");
        match WireFrame::decode(&alert.text).unwrap().message {
            WireMessage::Alert(alert) => assert_eq!(alert.symbol.as_deref(), Some("MSFT")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn subscriptions_are_per_client() {
        let state = AppState::new();
        state.add_client(1).await;
        state.add_client(2).await;

        assert_eq!(state.subscribe(1, keys(&["AAPL", "MSFT"])).await.len(), 2);
        assert_eq!(state.subscribe(1, keys(&["AAPL"])).await.len(), 0);
        state.subscribe(2, keys(&["TSLA"])).await;
        state.unsubscribe(1, keys(&["MSFT"])).await;

        assert!(state.is_subscribed(1, "AAPL").await);
        assert!(!state.is_subscribed(1, "MSFT").await);
        assert_eq!(state.subscribed_keys().await, keys(&["AAPL", "TSLA"]));

        state.remove_client(2).await;
        assert_eq!(state.client_count().await, 1);
    }
}
