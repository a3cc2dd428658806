//! # Derived Views
//!
//! A value computed from an explicit set of cache entries, e.g. a portfolio
//! total over its holdings. The view subscribes to exactly the keys it was
//! built from and recomputes whenever one of them changes.

use std::sync::{Arc, Mutex, Weak};

use crate::core::cache_store::CacheStore;
use crate::core::listeners::{ListenerSet, Unsubscribe};
use crate::model::entity::{CacheEntry, EntityKey};
use crate::utils::lock;

struct ViewState<V> {
    value: Mutex<V>,
    listeners: ListenerSet<V>,
}

/// # Derived View
///
/// Dropping the view unsubscribes it from the store.
pub struct DerivedView<V> {
    keys: Vec<EntityKey>,
    state: Arc<ViewState<V>>,
    subscriptions: Mutex<Vec<Unsubscribe>>,
}

impl<V> DerivedView<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Builds the view and computes its first value.
    ///
    /// `derive` receives the current entry for each key, in the order given.
    pub fn new<T, K, F>(store: &Arc<CacheStore<T>>, keys: impl IntoIterator<Item = K>, derive: F) -> Self
    where
        T: Clone + Send + Sync + 'static,
        K: Into<EntityKey>,
        F: Fn(&[Option<CacheEntry<T>>]) -> V + Send + Sync + 'static,
    {
        let keys: Vec<EntityKey> = keys.into_iter().map(Into::into).collect();
        let derive = Arc::new(derive);
        let state = Arc::new(ViewState {
            value: Mutex::new(compute(store, &keys, derive.as_ref())),
            listeners: ListenerSet::new(),
        });

        let weak_store: Weak<CacheStore<T>> = Arc::downgrade(store);
        let weak_state: Weak<ViewState<V>> = Arc::downgrade(&state);
        let shared_keys = Arc::new(keys.clone());

        let subscriptions = keys
            .iter()
            .map(|key| {
                let weak_store = weak_store.clone();
                let weak_state = weak_state.clone();
                let keys = Arc::clone(&shared_keys);
                let derive = Arc::clone(&derive);
                store.subscribe(key, move |_| {
                    let (Some(store), Some(state)) = (weak_store.upgrade(), weak_state.upgrade()) else {
                        return;
                    };
                    let next = compute(&store, &keys, derive.as_ref());
                    *lock(&state.value) = next.clone();
                    state.listeners.emit(&next);
                })
            })
            .collect();

        Self { keys, state, subscriptions: Mutex::new(subscriptions) }
    }

    /// The latest derived value.
    pub fn get(&self) -> V {
        lock(&self.state.value).clone()
    }

    /// The keys this view depends on.
    pub fn keys(&self) -> &[EntityKey] {
        &self.keys
    }

    /// Notified with the new value after every recomputation.
    pub fn on_change<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        self.state.listeners.add(listener)
    }
}

impl<V> Drop for DerivedView<V> {
    fn drop(&mut self) {
        for subscription in lock(&self.subscriptions).drain(..) {
            subscription.unsubscribe();
        }
    }
}

fn compute<T, V, F>(store: &CacheStore<T>, keys: &[EntityKey], derive: &F) -> V
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&[Option<CacheEntry<T>>]) -> V + ?Sized,
{
    let entries: Vec<Option<CacheEntry<T>>> = keys.iter().map(|key| store.get(key)).collect();
    derive(&entries)
}
