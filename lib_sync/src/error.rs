//! # Sync Errors
//!
//! Error taxonomy for the sync core. Only failures that a caller can act on are
//! represented here: remote-mutation rejections are recovered by rollback and
//! stale-rollback conflicts are expected outcomes, so neither appears below.

use thiserror::Error;

/// The error type shared by every module of `lib_sync`.
#[derive(Debug, Error)]
pub enum SyncError {
    /// `send` was called while the realtime channel had no open link.
    #[error("Realtime channel is not connected")]
    NotConnected,

    /// The configured channel URL could not be parsed or used.
    #[error("Invalid channel URL '{url}': {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The WebSocket handshake or transport failed.
    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    /// A realtime or cross-tab payload did not match the expected envelope.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Durable or shared storage could not be read or written.
    #[error("Storage I/O error: {0}")]
    Storage(#[from] std::io::Error),

    /// JSON (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The background task settling a mutation went away before reporting.
    #[error("Mutation for '{0}' was abandoned before it settled")]
    MutationAbandoned(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;
