//! Prometheus metrics definitions.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

/// Filesystem events consumed by the dispatch loop.
pub static EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "dirwatch_events_total",
        "Filesystem events processed by the dispatch loop",
        &["kind"]
    )
    .unwrap()
});

/// Aggregator writes by operation and outcome.
pub static RUN_WRITES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "dirwatch_run_writes_total",
        "Task run updates applied by the aggregator",
        &["operation", "outcome"]
    )
    .unwrap()
});

/// Files that could not be read.
pub static READ_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("dirwatch_read_errors_total", "Files that could not be scanned")
        .unwrap()
});

/// Paths the backend refused to watch.
pub static REGISTRATION_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "dirwatch_registration_errors_total",
        "Paths that could not be added to the OS watch"
    )
    .unwrap()
});

/// Paths currently registered.
pub static WATCHED_PATHS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("dirwatch_watched_paths", "Number of registered paths").unwrap()
});

/// 1 while the dispatch loop is running. Refreshed from the engine on scrape.
pub static ENGINE_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("dirwatch_engine_running", "Whether the watch engine is running").unwrap()
});

/// Initialize all metrics (call once at startup).
pub fn init_metrics() {
    let _ = &*EVENTS_TOTAL;
    let _ = &*RUN_WRITES_TOTAL;
    let _ = &*READ_ERRORS_TOTAL;
    let _ = &*REGISTRATION_ERRORS_TOTAL;
    let _ = &*WATCHED_PATHS;
    let _ = &*ENGINE_RUNNING;

    tracing::debug!("Prometheus metrics initialized");
}
