use clap::Parser;
use lib_sync::{ChannelConfig, CooldownConfig, CrossTabConfig, SyncConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "sync_client.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Realtime cache sync client", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "SYNC_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "SYNC_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "SYNC_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "SYNC_FEED_URL", help = "Realtime feed WebSocket URL (ws:// or wss://).")]
    pub feed_url: Option<String>,

    #[clap(long, env = "SYNC_AUTH_TOKEN", help = "Bearer token sent on the WebSocket handshake.")]
    pub auth_token: Option<String>,

    #[clap(long, env = "SYNC_SYMBOLS", value_delimiter = ',', help = "Comma separated entity keys to track.")]
    pub symbols: Option<Vec<String>>,

    #[clap(long, env = "SYNC_RECONNECT_BASE_DELAY_MS", help = "First reconnect delay in milliseconds.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "SYNC_RECONNECT_CAP_DELAY_MS", help = "Upper bound for the reconnect delay in milliseconds.")]
    pub reconnect_cap_delay_ms: Option<u64>,

    #[clap(long, env = "SYNC_RECONNECT_MAX_ATTEMPTS", help = "Consecutive failures before giving up.")]
    pub reconnect_max_attempts: Option<u32>,

    #[clap(long, env = "SYNC_STABILITY_WINDOW_MS", help = "Milliseconds a link must stay open before the attempt counter resets.")]
    pub stability_window_ms: Option<u64>,

    #[clap(long, env = "SYNC_IDLE_TIMEOUT_MS", help = "Milliseconds without inbound frames before the link is pinged (0 disables).")]
    pub idle_timeout_ms: Option<u64>,

    #[clap(long, env = "SYNC_PONG_TIMEOUT_MS", help = "Milliseconds an idle ping may go unanswered before the link is dropped.")]
    pub pong_timeout_ms: Option<u64>,

    #[clap(long, env = "SYNC_COOLDOWN_PATH", help = "File holding cooldown records across restarts.")]
    pub cooldown_path: Option<PathBuf>,

    #[clap(long, env = "SYNC_COOLDOWN_WINDOW_MS", help = "Dedup window for view counting in milliseconds.")]
    pub cooldown_window_ms: Option<u64>,
}

impl Config {
    /// `other` wins wherever it has a value.
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            feed_url: other.feed_url.or(self.feed_url),
            auth_token: other.auth_token.or(self.auth_token),
            symbols: other.symbols.or(self.symbols),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_cap_delay_ms: other.reconnect_cap_delay_ms.or(self.reconnect_cap_delay_ms),
            reconnect_max_attempts: other.reconnect_max_attempts.or(self.reconnect_max_attempts),
            stability_window_ms: other.stability_window_ms.or(self.stability_window_ms),
            idle_timeout_ms: other.idle_timeout_ms.or(self.idle_timeout_ms),
            pong_timeout_ms: other.pong_timeout_ms.or(self.pong_timeout_ms),
            cooldown_path: other.cooldown_path.or(self.cooldown_path),
            cooldown_window_ms: other.cooldown_window_ms.or(self.cooldown_window_ms),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn symbols(&self) -> Vec<String> {
        self.symbols
            .iter()
            .flatten()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn cooldown_path(&self) -> PathBuf {
        self.cooldown_path.clone().unwrap_or_else(|| PathBuf::from("./cooldowns.json"))
    }

    /// Library settings; anything unset keeps the library default.
    pub fn sync_config(&self) -> SyncConfig {
        let defaults = ChannelConfig::default();
        SyncConfig {
            channel: ChannelConfig {
                url: self.feed_url.clone().unwrap_or(defaults.url),
                auth_token: self.auth_token.clone(),
                base_delay_ms: self.reconnect_base_delay_ms.unwrap_or(defaults.base_delay_ms),
                cap_delay_ms: self.reconnect_cap_delay_ms.unwrap_or(defaults.cap_delay_ms),
                max_attempts: self.reconnect_max_attempts.unwrap_or(defaults.max_attempts),
                stability_window_ms: self.stability_window_ms.unwrap_or(defaults.stability_window_ms),
                idle_timeout_ms: self.idle_timeout_ms.unwrap_or(defaults.idle_timeout_ms),
                pong_timeout_ms: self.pong_timeout_ms.unwrap_or(defaults.pong_timeout_ms),
                ..defaults
            },
            cooldown: CooldownConfig {
                window_ms: self.cooldown_window_ms.unwrap_or(CooldownConfig::default().window_ms),
            },
            cross_tab: CrossTabConfig::default(),
        }
    }
}

fn default_config() -> Config {
    let cooldown_path = dirs::data_local_dir()
        .map(|dir| dir.join("sync_client").join("cooldowns.json"))
        .unwrap_or_else(|| PathBuf::from("./cooldowns.json"));

    Config {
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        feed_url: Some(ChannelConfig::default().url),
        symbols: Some(vec!["AAPL".to_string(), "MSFT".to_string()]),
        cooldown_path: Some(cooldown_path),
        ..Default::default()
    }
}

fn read_file_config(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<Config>(&text) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// defaults <- JSON file <- environment / command line.
pub fn load_config() -> Config {
    let cli = Config::parse();
    merge_sources(cli)
}

fn merge_sources(cli: Config) -> Config {
    let file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut config = default_config();
    if let Some(file_config) = read_file_config(&file_path) {
        config = config.merge(file_config);
    }
    config.merge(cli)
}
