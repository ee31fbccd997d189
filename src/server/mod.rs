//! Control API server.
//!
//! - REST endpoints using axum
//! - Prometheus metrics
//! - Tracing setup

mod app;
pub mod metrics;
pub mod observability;
mod rest;

pub use app::{App, ServerConfig};
pub use metrics::init_metrics;
pub use observability::{init_tracing, TracingConfig};
pub use rest::{create_rest_router, AppState, ConfigureRequest, RunResponse, SettingsResponse};
