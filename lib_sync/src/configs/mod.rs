//! # Configuration Modules
//!
//! Typed configuration for the sync core. Every struct has a `Default` that
//! matches production behaviour, and deserializes from camelCase JSON with
//! durations expressed in milliseconds.

/// Channel, cooldown and cross-tab settings.
pub mod config_sync;
