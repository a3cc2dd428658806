//! # Cooldown Ledger
//!
//! Per-entity, per-viewer dedup windows kept in durable storage so they
//! survive restarts. A view increment fires at most once per viewer per
//! window; a failed remote confirmation revokes the record so a legitimate
//! retry is not suppressed.
//!
//! The check in [`CooldownLedger::should_fire`] and the write in
//! [`CooldownLedger::record_fired`] are separate steps. Two tabs racing on the
//! same entity within milliseconds can both pass the check. The window is
//! coarse, so this stays best-effort rather than taking a cross-tab lock.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::configs::config_sync::CooldownConfig;
use crate::error::Result;
use crate::storage::KeyValueStore;
use crate::utils::time::{Clock, SystemClock};

const KEY_PREFIX: &str = "cooldown_";

/// The persisted record, `{"lastActionAt": <epoch-ms>}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownRecord {
    /// When the action last fired.
    pub last_action_at: i64,
}

/// # Cooldown Ledger
pub struct CooldownLedger {
    storage: Arc<dyn KeyValueStore>,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl CooldownLedger {
    /// Creates a ledger over `storage` using the system clock.
    pub fn new(storage: Arc<dyn KeyValueStore>, config: &CooldownConfig) -> Self {
        Self::with_clock(storage, config, Arc::new(SystemClock))
    }

    /// Creates a ledger with an explicit clock.
    pub fn with_clock(storage: Arc<dyn KeyValueStore>, config: &CooldownConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            window: Duration::from_millis(config.window_ms),
            clock,
        }
    }

    /// Storage key for one `(entity, viewer)` pair.
    pub fn storage_key(entity_key: &str, viewer_scope: &str) -> String {
        format!("{}{}@{}", KEY_PREFIX, entity_key, viewer_scope)
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }

    /// Reads the record for a pair. Unparseable records read as absent.
    pub fn record(&self, entity_key: &str, viewer_scope: &str) -> Result<Option<CooldownRecord>> {
        let key = Self::storage_key(entity_key, viewer_scope);
        let Some(raw) = self.storage.get(&key)? else {
            return Ok(None);
        };
        match serde_json::from_str::<CooldownRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                log::warn!("Discarding malformed cooldown record {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// `true` iff no record exists or the window has elapsed since it was written.
    ///
    /// Storage failures fail open: losing a dedup is preferable to losing an action.
    pub fn should_fire(&self, entity_key: &str, viewer_scope: &str) -> bool {
        match self.record(entity_key, viewer_scope) {
            Ok(Some(record)) => self.clock.now_ms().saturating_sub(record.last_action_at) >= self.window_ms(),
            Ok(None) => true,
            Err(e) => {
                log::warn!("Cooldown lookup failed for {}@{}: {}", entity_key, viewer_scope, e);
                true
            }
        }
    }

    /// Stamps the pair with the current time.
    pub fn record_fired(&self, entity_key: &str, viewer_scope: &str) -> Result<()> {
        let record = CooldownRecord { last_action_at: self.clock.now_ms() };
        self.storage.set(
            &Self::storage_key(entity_key, viewer_scope),
            &serde_json::to_string(&record)?,
        )
    }

    /// Forgets the pair so the next `should_fire` returns `true`.
    pub fn revoke(&self, entity_key: &str, viewer_scope: &str) -> Result<()> {
        self.storage.remove(&Self::storage_key(entity_key, viewer_scope))
    }

    /// Deletes every record whose window has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let window = self.window_ms();
        let mut purged = 0;
        for key in self.storage.keys()? {
            if !key.starts_with(KEY_PREFIX) {
                continue;
            }
            let expired = match self.storage.get(&key)? {
                Some(raw) => serde_json::from_str::<CooldownRecord>(&raw)
                    .map(|record| now.saturating_sub(record.last_action_at) >= window)
                    .unwrap_or(true),
                None => false,
            };
            if expired {
                self.storage.remove(&key)?;
                purged += 1;
            }
        }
        if purged > 0 {
            log::debug!("Purged {} expired cooldown records", purged);
        }
        Ok(purged)
    }
}
