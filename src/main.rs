//! Dirwatch - directory activity watcher
//!
//! Entry point for the Dirwatch server.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dirwatch::config::{ScanPolicy, WatchSettings};
use dirwatch::server::{init_metrics, init_tracing, App, ServerConfig, TracingConfig};
use dirwatch::storage::{init_storage, Database};
use dirwatch::watcher::Engine;
use dirwatch::{Config, Result};

/// Dirwatch - aggregates directory activity into task runs
#[derive(Parser, Debug)]
#[command(name = "dirwatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Data directory for `SQLite` database
    #[arg(short, long, env = "DIRWATCH_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Host address to bind to
    #[arg(long, env = "DIRWATCH_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "DIRWATCH_PORT", default_value = "8080")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "DIRWATCH_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, env = "DIRWATCH_LOG_JSON")]
    log_json: bool,

    /// Directory to watch
    #[arg(short = 'w', long, env = "DIRWATCH_DIRECTORY", default_value = "./watched")]
    directory: PathBuf,

    /// Marker string counted in file contents (case-insensitive)
    #[arg(short, long, env = "DIRWATCH_MARKER", default_value = "There you are!!")]
    marker: String,

    /// Aggregation window, e.g. "5m" or "90s"
    #[arg(long, env = "DIRWATCH_SCAN_INTERVAL", default_value = "5m", value_parser = humantime::parse_duration)]
    scan_interval: Duration,

    /// How scans join runs
    #[arg(long, env = "DIRWATCH_SCAN_POLICY", value_enum, default_value_t = ScanPolicy::Join)]
    scan_policy: ScanPolicy,

    /// Start watching as soon as the server boots
    #[arg(long, env = "DIRWATCH_AUTOSTART", default_value_t = true, action = clap::ArgAction::Set)]
    autostart: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&TracingConfig {
        level: cli.log_level.clone(),
        json: cli.log_json,
    });

    tracing::info!("Dirwatch v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config {
        data_dir: cli.data_dir,
        host: cli.host,
        port: cli.port,
        log_level: cli.log_level,
        watch: WatchSettings {
            directory: cli.directory,
            marker: cli.marker,
            scan_interval: cli.scan_interval,
            scan_policy: cli.scan_policy,
        },
        autostart: cli.autostart,
    };

    tracing::debug!(?config, "Configuration loaded");
    config.validate()?;

    tracing::info!(
        addr = %config.server_addr(),
        data_dir = %config.data_dir.display(),
        directory = %config.watch.directory.display(),
        "Configuration validated"
    );

    let db = Database::open(config.database_path())?;
    init_storage(&db)?;
    init_metrics();

    std::fs::create_dir_all(&config.watch.directory)?;
    let engine = Arc::new(Engine::new(db.clone(), config.shared_settings()));

    if config.autostart {
        let starter = Arc::clone(&engine);
        match tokio::task::spawn_blocking(move || starter.start()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Watcher failed to start"),
            Err(e) => tracing::error!(error = %e, "Watcher start task failed"),
        }
    }

    let server_config = ServerConfig {
        host: config.host,
        port: config.port,
    };

    App::new(server_config, db, engine).run().await
}
