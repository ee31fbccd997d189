//! Dirwatch Library
//!
//! Watches a directory tree and aggregates bursts of filesystem activity
//! into durable task runs.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod server;
pub mod storage;
pub mod watcher;

pub use config::Config;
pub use error::{Error, Result};
