//! # Reconnect Backoff
//!
//! The channel's reconnect bookkeeping, kept free of I/O so every transition
//! can be tested without a socket.
//!
//! `delay(attempt) = min(base * 2^attempt, cap)`. The delay is computed from
//! the attempt count *before* it is incremented, so the first retry waits
//! `base`. Once `max_attempts` consecutive links have failed the channel stops
//! retrying and reports `FAILED`. The counter resets only after a link has
//! stayed open for the stability window, never on OPEN alone.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::configs::config_sync::ChannelConfig;

/// Lifecycle of the realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    /// Never connected.
    Idle,
    /// Handshake in progress, or waiting to retry.
    Connecting,
    /// Link is up.
    Open,
    /// Link is down, after a remote close, an error or `close()`.
    Closed,
    /// Retries exhausted; only an explicit `connect` resumes.
    Failed,
}

impl ConnectionStatus {
    /// `true` only for [`ConnectionStatus::Open`].
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Open
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionStatus::Idle => "IDLE",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Open => "OPEN",
            ConnectionStatus::Closed => "CLOSED",
            ConnectionStatus::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// First delay.
    pub base: Duration,
    /// Upper bound.
    pub cap: Duration,
    /// Consecutive failures tolerated.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.cap).min(self.cap)
    }
}

impl From<&ChannelConfig> for BackoffPolicy {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            cap: Duration::from_millis(config.cap_delay_ms),
            max_attempts: config.max_attempts,
        }
    }
}

/// Snapshot of the reconnect bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectState {
    /// Consecutive failed links since the last stable one.
    pub attempt: u32,
    /// Delay scheduled for the next retry, if any.
    pub next_delay_ms: Option<u64>,
    /// Current lifecycle state.
    pub status: ConnectionStatus,
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self { attempt: 0, next_delay_ms: None, status: ConnectionStatus::Idle }
    }
}

impl ReconnectState {
    /// A handshake is starting.
    pub fn on_connecting(&mut self) {
        self.status = ConnectionStatus::Connecting;
        self.next_delay_ms = None;
    }

    /// The handshake completed.
    pub fn on_open(&mut self) {
        self.status = ConnectionStatus::Open;
        self.next_delay_ms = None;
    }

    /// The link stayed open for the stability window.
    pub fn on_stable(&mut self) {
        self.attempt = 0;
    }

    /// Schedules the retry that follows a `CLOSED` transition not caused by `close()`.
    ///
    /// Returns the delay before the next retry, or `None` once retries are
    /// exhausted, in which case the status is now `FAILED`.
    pub fn on_closed(&mut self, policy: &BackoffPolicy) -> Option<Duration> {
        if self.attempt >= policy.max_attempts {
            self.status = ConnectionStatus::Failed;
            self.next_delay_ms = None;
            return None;
        }
        let delay = policy.delay_for(self.attempt);
        self.attempt += 1;
        self.status = ConnectionStatus::Connecting;
        self.next_delay_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        Some(delay)
    }

    /// The link went down.
    pub fn on_link_closed(&mut self) {
        self.status = ConnectionStatus::Closed;
        self.next_delay_ms = None;
    }

    /// An explicit `connect` after `FAILED` or `CLOSED` starts from scratch.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(30_000),
            max_attempts,
        }
    }

    #[test]
    fn delays_double_until_capped() {
        let policy = policy(10);
        let delays: Vec<u128> = (0..7).map(|a| policy.delay_for(a).as_millis()).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
        assert_eq!(policy.delay_for(64), Duration::from_millis(30_000));
    }

    #[test]
    fn fails_after_max_consecutive_failures() {
        let policy = policy(5);
        let mut state = ReconnectState::default();
        let mut scheduled = Vec::new();
        while let Some(delay) = state.on_closed(&policy) {
            scheduled.push(delay.as_millis());
        }
        assert_eq!(scheduled, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
        assert_eq!(state.status, ConnectionStatus::Failed);
        assert_eq!(state.attempt, 5);
    }

    #[test]
    fn open_alone_does_not_reset_attempts() {
        let policy = policy(5);
        let mut state = ReconnectState::default();
        state.on_closed(&policy);
        state.on_closed(&policy);
        state.on_open();
        assert_eq!(state.attempt, 2);
        assert_eq!(state.on_closed(&policy), Some(Duration::from_millis(4_000)));

        state.on_open();
        state.on_stable();
        assert_eq!(state.on_closed(&policy), Some(Duration::from_millis(1_000)));
    }

    #[test]
    fn status_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&ConnectionStatus::Open).unwrap(), "\"OPEN\"");
        assert_eq!(ConnectionStatus::Failed.to_string(), "FAILED");
    }
}
