//! # Listener Sets
//!
//! Explicit listener registration shared by the cache, the channel and the
//! bus. Every registration hands back an [`Unsubscribe`] handle so ownership
//! of a subscription is always visible at the call site.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::utils::lock;

/// A registered callback.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

type Slots<E> = Mutex<Vec<(u64, Listener<E>)>>;

/// An ordered set of listeners for events of type `E`.
///
/// Listeners run synchronously, in registration order, on the thread that
/// emits. The internal lock is released before any listener runs, so a
/// listener may register or remove listeners (including itself).
pub struct ListenerSet<E> {
    slots: Arc<Slots<E>>,
    next_id: Arc<AtomicU64>,
}

impl<E> Clone for ListenerSet<E> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<E> Default for ListenerSet<E> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl<E: 'static> ListenerSet<E> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` and returns the handle that removes it.
    pub fn add<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.slots).push((id, Arc::new(listener)));

        let slots: Weak<Slots<E>> = Arc::downgrade(&self.slots);
        Unsubscribe::new(move || {
            if let Some(slots) = slots.upgrade() {
                lock(&slots).retain(|(slot_id, _)| *slot_id != id);
            }
        })
    }

    /// Invokes every listener with `event`.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = lock(&self.slots)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    /// `true` when nobody is listening.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by every `subscribe`/`on_*` registration.
///
/// Dropping the handle leaves the listener registered; call
/// [`Unsubscribe::unsubscribe`] to remove it.
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct Unsubscribe {
    action: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Unsubscribe {
    /// Wraps a removal action.
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self { action: Some(Box::new(action)) }
    }

    /// Removes the listener. Calling this after the source is gone is a no-op.
    pub fn unsubscribe(mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.action.is_some())
            .finish()
    }
}
