use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "realtime_dummy.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Synthetic realtime feed for exercising sync clients", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "DUMMY_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "DUMMY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "DUMMY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "DUMMY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "DUMMY_TICK_MS", help = "Milliseconds between generated update rounds.")]
    pub tick_ms: Option<u64>,

    #[clap(long, env = "DUMMY_ALERT_PROBABILITY", help = "Chance per tick of emitting an ALERT (0.0 - 1.0).")]
    pub alert_probability: Option<f64>,
}

impl Config {
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            tick_ms: other.tick_ms.or(self.tick_ms),
            alert_probability: other.alert_probability.or(self.alert_probability),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(9002)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn tick_ms(&self) -> u64 {
        self.tick_ms.unwrap_or(1_000).max(10)
    }

    pub fn alert_probability(&self) -> f64 {
        self.alert_probability.unwrap_or(0.02).clamp(0.0, 1.0)
    }
}

fn read_file_config(path: &Path) -> Option<Config> {
    let text = fs::read_to_string(path).ok()?;
    match serde_json::from_str::<Config>(&text) {
        Ok(config) => Some(config),
        Err(e) => {
            log::warn!("Failed to parse config file {}: {}", path.display(), e);
            None
        }
    }
}

pub fn load_config() -> Config {
    let cli = Config::parse();
    let file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let defaults = Config {
        port: Some(9002),
        tick_ms: Some(1_000),
        ..Default::default()
    };
    let config = match read_file_config(&file_path) {
        Some(file_config) => defaults.merge(file_config),
        None => defaults,
    };
    config.merge(cli)
}
