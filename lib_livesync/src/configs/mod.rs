//! # Configuration Modules
//!
//! Layered client configuration: built-in defaults, an optional JSON file,
//! `LIVESYNC_*` environment variables and finally command-line flags.

/// Configuration loading, layering and validation.
pub mod config_sys;

pub use config_sys::{ConfigOverlay, DEFAULT_CONFIG_FILE, ENV_PREFIX, SyncConfig};
