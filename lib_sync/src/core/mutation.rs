//! # Mutation Coordinator
//!
//! Orchestrates optimistic local writes, remote confirmation and rollback.
//!
//! ## Flow of one mutation
//! 1. Snapshot the entity and apply the optimistic change in one atomic
//!    `CacheStore::update`, so the UI sees it with zero latency.
//! 2. Record a [`PendingMutation`] holding the snapshot and the version the
//!    optimistic write produced.
//! 3. Run the remote operation on a background task; the caller gets a
//!    [`MutationHandle`] right away and may await it for the final outcome.
//! 4. On success, drop the pending record, apply server-canonical data if the
//!    remote returned any, and optionally broadcast the confirmed value to
//!    other tabs.
//! 5. On failure, restore the snapshot guarded by the optimistic version. If
//!    anything newer landed in between (a realtime push, a cross-tab patch,
//!    another local write), the guard rejects and the rollback is abandoned.
//!    Derived counters roll back the same way and any cooldown is revoked.
//!
//! Remote failures never escape as errors; they always become step 5.

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::core::cache_store::CacheStore;
use crate::core::cooldown::CooldownLedger;
use crate::core::cross_tab::CrossTabBus;
use crate::error::{Result, SyncError};
use crate::model::entity::{CacheEntry, EntityKey, MutationKind};
use crate::utils::lock;

/// Counter bumped by [`MutationCoordinator::record_view`].
pub const VIEW_COUNT_FIELD: &str = "viewCount";

/// Error type a remote collaborator may fail with.
pub type RemoteError = Box<dyn std::error::Error + Send + Sync>;

/// What a remote operation resolves to: optional server-canonical entity data.
pub type RemoteResult = std::result::Result<Option<Value>, RemoteError>;

/// An optimistic write awaiting confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    /// Coordinator-local id.
    pub id: u64,
    /// The mutated entity.
    pub key: EntityKey,
    /// The value before the optimistic write; `None` if the entity did not exist.
    pub previous_snapshot: Option<Value>,
    /// Entity version right before the optimistic write.
    pub version_at_issue: u64,
    /// Entity version the optimistic write produced; the rollback guard.
    pub applied_version: u64,
    /// What was applied.
    pub kind: MutationKind,
}

/// A `(entity, viewer)` cooldown to revoke if the mutation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooldownGuard {
    /// Entity whose action was recorded.
    pub entity_key: EntityKey,
    /// Viewer scope the record belongs to.
    pub viewer_scope: String,
}

/// A mutation plus everything that must roll back with it.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    /// Primary entity.
    pub key: EntityKey,
    /// Primary change.
    pub kind: MutationKind,
    /// Piggybacking changes on other entities, e.g. a post's `commentCount`.
    pub derived: Vec<(EntityKey, MutationKind)>,
    /// Cooldown record to revoke on failure.
    pub cooldown: Option<CooldownGuard>,
}

impl MutationRequest {
    /// A request touching a single entity.
    pub fn new(key: impl Into<EntityKey>, kind: MutationKind) -> Self {
        Self { key: key.into(), kind, derived: Vec::new(), cooldown: None }
    }

    /// Adds a derived change that is applied and rolled back alongside.
    pub fn with_derived(mut self, key: impl Into<EntityKey>, kind: MutationKind) -> Self {
        self.derived.push((key.into(), kind));
        self
    }

    /// Attaches a cooldown record to revoke on failure.
    pub fn with_cooldown(mut self, entity_key: impl Into<EntityKey>, viewer_scope: impl Into<String>) -> Self {
        self.cooldown = Some(CooldownGuard {
            entity_key: entity_key.into(),
            viewer_scope: viewer_scope.into(),
        });
        self
    }
}

/// How a mutation settled.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The remote accepted; `entry` is the primary entity after reconciliation.
    Confirmed {
        /// Primary entity after confirmation.
        entry: Option<CacheEntry<Value>>,
    },
    /// The remote rejected and the snapshot was restored.
    RolledBack {
        /// The remote error, rendered.
        error: String,
    },
    /// The remote rejected but a newer write had landed, so the snapshot was not restored.
    Superseded {
        /// The remote error, rendered.
        error: String,
    },
    /// The cooldown window suppressed the action; nothing was written or sent.
    Suppressed,
}

/// Returned by every `perform*` call once the optimistic write is visible.
#[derive(Debug)]
pub struct MutationHandle {
    key: EntityKey,
    optimistic: Option<CacheEntry<Value>>,
    rx: oneshot::Receiver<MutationOutcome>,
}

impl MutationHandle {
    fn settled_now(key: EntityKey, outcome: MutationOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { key, optimistic: None, rx }
    }

    /// The primary entry as written optimistically (`None` when suppressed).
    pub fn optimistic(&self) -> Option<&CacheEntry<Value>> {
        self.optimistic.as_ref()
    }

    /// Waits for remote confirmation or rollback.
    pub async fn settled(self) -> Result<MutationOutcome> {
        self.rx.await.map_err(|_| SyncError::MutationAbandoned(self.key))
    }
}

/// # Mutation Coordinator
pub struct MutationCoordinator {
    store: Arc<CacheStore<Value>>,
    ledger: Option<Arc<CooldownLedger>>,
    bus: Option<Arc<CrossTabBus>>,
    pending: Arc<Mutex<HashMap<u64, PendingMutation>>>,
    next_id: AtomicU64,
}

impl MutationCoordinator {
    /// Creates a coordinator over `store`.
    pub fn new(store: Arc<CacheStore<Value>>) -> Self {
        Self {
            store,
            ledger: None,
            bus: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Enables cooldown-gated actions and cooldown revocation.
    pub fn with_ledger(mut self, ledger: Arc<CooldownLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Broadcasts confirmed values to other tabs.
    pub fn with_cross_tab(mut self, bus: Arc<CrossTabBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// The store this coordinator writes to.
    pub fn store(&self) -> &Arc<CacheStore<Value>> {
        &self.store
    }

    /// In-flight optimistic writes, oldest first.
    pub fn pending(&self) -> Vec<PendingMutation> {
        let mut pending: Vec<PendingMutation> = lock(&self.pending).values().cloned().collect();
        pending.sort_by_key(|p| p.id);
        pending
    }

    /// Optimistically applies `kind` to `key` and confirms it with `remote`.
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime; settlement runs on a spawned task.
    pub fn perform<F, Fut>(&self, key: &str, kind: MutationKind, remote: F) -> MutationHandle
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RemoteResult> + Send + 'static,
    {
        self.perform_with(MutationRequest::new(key, kind), remote)
    }

    /// Like [`perform`](Self::perform) for a request with derived changes and a cooldown.
    pub fn perform_with<F, Fut>(&self, request: MutationRequest, remote: F) -> MutationHandle
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RemoteResult> + Send + 'static,
    {
        let primary = self.apply_optimistic(&request.key, &request.kind);
        let optimistic = self.store.get(&request.key);
        let derived: Vec<u64> = request
            .derived
            .iter()
            .map(|(key, kind)| self.apply_optimistic(key, kind))
            .collect();

        let settler = Settler {
            store: Arc::clone(&self.store),
            ledger: self.ledger.clone(),
            bus: self.bus.clone(),
            pending: Arc::clone(&self.pending),
        };
        let (tx, rx) = oneshot::channel();
        let future = remote();
        let cooldown = request.cooldown;
        let key = request.key.clone();

        tokio::spawn(async move {
            let outcome = match future.await {
                Ok(canonical) => settler.confirm(&key, primary, &derived, canonical),
                Err(e) => settler.roll_back(&key, primary, &derived, cooldown.as_ref(), e),
            };
            let _ = tx.send(outcome);
        });

        MutationHandle { key: request.key, optimistic, rx }
    }

    /// The dedup-gated view increment.
    ///
    /// Within the cooldown window for `(key, viewer_scope)` this returns an
    /// already-settled [`MutationOutcome::Suppressed`] without touching the
    /// cache or calling `remote`. Otherwise it records the cooldown, bumps
    /// `viewCount` and revokes the cooldown again if `remote` fails.
    pub fn record_view<F, Fut>(&self, key: &str, viewer_scope: &str, remote: F) -> MutationHandle
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RemoteResult> + Send + 'static,
    {
        let mut request = MutationRequest::new(key, MutationKind::increment(VIEW_COUNT_FIELD, 1));

        if let Some(ledger) = &self.ledger {
            if !ledger.should_fire(key, viewer_scope) {
                log::debug!("View of {} by {} suppressed by cooldown", key, viewer_scope);
                return MutationHandle::settled_now(key.to_string(), MutationOutcome::Suppressed);
            }
            if let Err(e) = ledger.record_fired(key, viewer_scope) {
                log::warn!("Could not persist cooldown for {}@{}: {}", key, viewer_scope, e);
            }
            request = request.with_cooldown(key, viewer_scope);
        }

        self.perform_with(request, remote)
    }

    fn apply_optimistic(&self, key: &str, kind: &MutationKind) -> u64 {
        let mut previous = None;
        let outcome = self.store.update(
            key,
            |current| {
                previous = current.cloned();
                kind.apply(current)
            },
            None,
        );
        let applied_version = outcome.entry.map(|entry| entry.version).unwrap_or_default();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.pending).insert(
            id,
            PendingMutation {
                id,
                key: key.to_string(),
                previous_snapshot: previous,
                version_at_issue: applied_version.saturating_sub(1),
                applied_version,
                kind: kind.clone(),
            },
        );
        id
    }
}

/// The pieces a background settlement needs.
struct Settler {
    store: Arc<CacheStore<Value>>,
    ledger: Option<Arc<CooldownLedger>>,
    bus: Option<Arc<CrossTabBus>>,
    pending: Arc<Mutex<HashMap<u64, PendingMutation>>>,
}

impl Settler {
    fn take(&self, ids: impl IntoIterator<Item = u64>) -> Vec<PendingMutation> {
        let mut pending = lock(&self.pending);
        ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
    }

    fn confirm(&self, key: &str, primary: u64, derived: &[u64], canonical: Option<Value>) -> MutationOutcome {
        let settled = self.take(std::iter::once(primary).chain(derived.iter().copied()));

        if let Some(value) = canonical {
            self.store.set(key, value, None);
        }

        if let Some(bus) = &self.bus {
            for pending in &settled {
                if let Some(entry) = self.store.get(&pending.key) {
                    if let Err(e) = bus.broadcast(&pending.key, entry.value) {
                        log::warn!("Cross-tab broadcast for {} failed: {}", pending.key, e);
                    }
                }
            }
        }

        log::debug!("Mutation on {} confirmed", key);
        MutationOutcome::Confirmed { entry: self.store.get(key) }
    }

    fn roll_back(
        &self,
        key: &str,
        primary: u64,
        derived: &[u64],
        cooldown: Option<&CooldownGuard>,
        error: RemoteError,
    ) -> MutationOutcome {
        log::warn!("Remote mutation on {} failed, rolling back: {}", key, error);

        let mut primary_restored = false;
        for pending in self.take(std::iter::once(primary).chain(derived.iter().copied())) {
            let restored = self.restore(&pending);
            if pending.id == primary {
                primary_restored = restored;
            }
        }

        if let (Some(ledger), Some(guard)) = (&self.ledger, cooldown) {
            if let Err(e) = ledger.revoke(&guard.entity_key, &guard.viewer_scope) {
                log::warn!(
                    "Could not revoke cooldown {}@{}: {}",
                    guard.entity_key,
                    guard.viewer_scope,
                    e
                );
            }
        }

        let error = error.to_string();
        if primary_restored {
            MutationOutcome::RolledBack { error }
        } else {
            MutationOutcome::Superseded { error }
        }
    }

    /// Puts the snapshot back unless the entity moved past the optimistic version.
    fn restore(&self, pending: &PendingMutation) -> bool {
        let guard = Some(pending.applied_version);
        let restored = match &pending.previous_snapshot {
            Some(previous) => self.store.set(&pending.key, previous.clone(), guard).applied,
            None => self.store.remove(&pending.key, guard),
        };
        if !restored {
            log::debug!(
                "Rollback of {} skipped: version moved past {}",
                pending.key,
                pending.applied_version
            );
        }
        restored
    }
}
