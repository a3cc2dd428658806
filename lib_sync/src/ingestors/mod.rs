//! # Realtime Ingestors Module
//!
//! The network-facing half of the sync core. The realtime feed is the
//! authoritative source of truth; everything here exists to keep a link to it
//! alive and to turn its frames into typed messages.
//!
//! ## Contained Modules:
//! - **`backoff`**: the reconnect state machine and exponential backoff,
//!   free of I/O.
//! - **`realtime_wss`**: [`ReconnectingChannel`], a self-healing WebSocket
//!   link with subscription replay.

/// Reconnect bookkeeping and backoff policy.
pub mod backoff;
/// The reconnecting WebSocket channel.
pub mod realtime_wss;

// --- Public API Re-exports ---
pub use backoff::{BackoffPolicy, ConnectionStatus, ReconnectState};
pub use realtime_wss::{ReconnectingChannel, ReplaySource};
