use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(feature = "configs")]
use std::path::Path;

#[cfg(feature = "configs")]
use crate::error::Result;

/// Default reconnect base delay.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
/// Default reconnect delay cap.
pub const DEFAULT_CAP_DELAY_MS: u64 = 30_000;
/// Consecutive failures before the channel gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// How long a link must stay open before the attempt counter resets.
pub const DEFAULT_STABILITY_WINDOW_MS: u64 = 5_000;
/// Default dedup window: 24 hours.
pub const DEFAULT_COOLDOWN_WINDOW_MS: u64 = 24 * 60 * 60 * 1_000;

/// # Channel Config
///
/// Settings for the reconnecting realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelConfig {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// Bearer credential from the auth collaborator, sent as `Authorization`.
    pub auth_token: Option<String>,
    /// First retry delay; doubles per attempt.
    pub base_delay_ms: u64,
    /// Upper bound for the retry delay.
    pub cap_delay_ms: u64,
    /// Consecutive failed links before entering `FAILED`.
    pub max_attempts: u32,
    /// Time an open link must survive before `attempt` resets to 0.
    pub stability_window_ms: u64,
    /// Handshake timeout.
    pub connect_timeout_ms: u64,
    /// After this long without an inbound frame the link is pinged; 0 disables the watchdog.
    pub idle_timeout_ms: u64,
    /// How long an unanswered ping may stay outstanding before the link is declared dead.
    pub pong_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9002/ws".to_string(),
            auth_token: None,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            cap_delay_ms: DEFAULT_CAP_DELAY_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            stability_window_ms: DEFAULT_STABILITY_WINDOW_MS,
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 60_000,
            pong_timeout_ms: 10_000,
        }
    }
}

impl ChannelConfig {
    /// Default settings pointed at `url`.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    /// Stability window as a `Duration`.
    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }

    /// Handshake timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Idle watchdog, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    /// Grace period for the idle ping's answer.
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }
}

/// # Cooldown Config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CooldownConfig {
    /// Dedup window length.
    pub window_ms: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self { window_ms: DEFAULT_COOLDOWN_WINDOW_MS }
    }
}

/// # Cross-Tab Config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrossTabConfig {
    /// Delay between writing a pulse and deleting it.
    pub cleanup_delay_ms: u64,
}

impl Default for CrossTabConfig {
    fn default() -> Self {
        Self { cleanup_delay_ms: 500 }
    }
}

impl CrossTabConfig {
    /// Cleanup delay as a `Duration`.
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }
}

/// # Sync Config
///
/// Aggregate of every component's settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Realtime channel.
    pub channel: ChannelConfig,
    /// Cooldown ledger.
    pub cooldown: CooldownConfig,
    /// Cross-tab bus.
    pub cross_tab: CrossTabConfig,
}

impl SyncConfig {
    /// Reads a JSON file; absent fields keep their defaults.
    #[cfg(feature = "configs")]
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: SyncConfig = serde_json::from_str(
            r#"{"channel":{"url":"wss://feed.example/ws","authToken":"t0k"},"cooldown":{"windowMs":1000}}"#,
        )
        .unwrap();
        assert_eq!(cfg.channel.url, "wss://feed.example/ws");
        assert_eq!(cfg.channel.auth_token.as_deref(), Some("t0k"));
        assert_eq!(cfg.channel.base_delay_ms, 1_000);
        assert_eq!(cfg.channel.cap_delay_ms, 30_000);
        assert_eq!(cfg.channel.max_attempts, 5);
        assert_eq!(cfg.channel.pong_timeout_ms, 10_000);
        assert_eq!(cfg.cooldown.window_ms, 1_000);
        assert_eq!(cfg.cross_tab, CrossTabConfig::default());
    }

    #[test]
    fn zero_idle_timeout_disables_watchdog() {
        let cfg = ChannelConfig { idle_timeout_ms: 0, ..ChannelConfig::default() };
        assert_eq!(cfg.idle_timeout(), None);
    }

    #[cfg(feature = "configs")]
    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, r#"{"crossTab":{"cleanupDelayMs":50}}"#).unwrap();
        let cfg = SyncConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.cross_tab.cleanup_delay_ms, 50);
        assert_eq!(cfg.channel, ChannelConfig::default());
    }
}
