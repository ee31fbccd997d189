//! Configuration management for Dirwatch.
//!
//! Supports configuration from:
//! - Command-line arguments (highest priority)
//! - Environment variables
//! - Built-in defaults (lowest priority)
//!
//! The watch-related subset ([`WatchSettings`]) can be replaced at runtime
//! through the control API.

mod settings;

pub use settings::{Config, ScanPolicy, SharedSettings, WatchSettings};
