//! Structured logging and tracing configuration.
//!
//! Plain-text or JSON output through `tracing-subscriber`, filtered by
//! `RUST_LOG` when set and by the configured level otherwise.

use tracing_subscriber::{
    filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Registry,
};

/// Tracing configuration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Enable JSON output format
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Initialize tracing with the given configuration.
///
/// # Panics
///
/// Panics if a tracing subscriber has already been initialized in this process.
pub fn init_tracing(config: &TracingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json {
        let json_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true);

        Registry::default().with(env_filter).with(json_layer).init();
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true);

        Registry::default().with(env_filter).with(fmt_layer).init();
    }

    tracing::debug!(level = %config.level, json = config.json, "Tracing initialized");
}

/// Spans shared by the HTTP layer and the dispatch thread.
pub mod spans {
    use std::path::Path;

    use tracing::{info_span, Span};

    /// Span for one HTTP request.
    #[must_use]
    pub fn request_span(method: &str, uri: &str, request_id: &str) -> Span {
        info_span!(
            "http_request",
            method = %method,
            uri = %uri,
            request_id = %request_id,
        )
    }

    /// Span covering the lifetime of a dispatch loop.
    #[must_use]
    pub fn dispatch_span(root: &Path) -> Span {
        info_span!("dispatch", root = %root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_tracing_config_default() {
        let config = TracingConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.json);
    }

    #[test]
    fn test_span_creation() {
        let span = spans::request_span("GET", "/task-run", "req-123");
        let _guard = span.enter();
        let span = spans::dispatch_span(Path::new("/tmp/watched"));
        let _guard = span.enter();
    }
}
