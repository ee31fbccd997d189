//! REST control API.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};

use super::metrics::ENGINE_RUNNING;
use crate::config::{ScanPolicy, WatchSettings};
use crate::error::{StorageError, WatcherError};
use crate::storage::{Database, RunStatus, RunTrigger, TaskRun};
use crate::watcher::{DispatchStatsSnapshot, Engine};

const DEFAULT_RUN_LIMIT: usize = 20;
const MAX_RUN_LIMIT: usize = 1000;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub engine: Arc<Engine>,
}

impl AppState {
    /// Create new state.
    #[must_use]
    pub const fn new(db: Database, engine: Arc<Engine>) -> Self {
        Self { db, engine }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
}

/// A task run as served over HTTP.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub id: Option<i64>,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    /// Seconds, derived at read time.
    pub runtime: f64,
    pub files_added: Vec<String>,
    pub files_deleted: Vec<String>,
    pub magic_string_hits: u64,
    pub status: RunStatus,
    pub opened_by: RunTrigger,
}

impl From<TaskRun> for RunResponse {
    fn from(run: TaskRun) -> Self {
        Self {
            runtime: run.runtime().as_secs_f64(),
            id: run.id,
            start_time: run.start_time,
            end_time: run.end_time,
            files_added: run.files_added,
            files_deleted: run.files_deleted,
            magic_string_hits: run.magic_string_hits,
            status: run.status,
            opened_by: run.opened_by,
        }
    }
}

/// Settings as served over HTTP.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsResponse {
    pub directory: PathBuf,
    pub magic_string: String,
    pub time_interval: String,
    pub scan_policy: ScanPolicy,
}

impl From<WatchSettings> for SettingsResponse {
    fn from(settings: WatchSettings) -> Self {
        Self {
            directory: settings.directory,
            magic_string: settings.marker,
            time_interval: humantime::format_duration(settings.scan_interval).to_string(),
            scan_policy: settings.scan_policy,
        }
    }
}

/// Partial settings update. Omitted fields keep their value.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureRequest {
    pub directory: Option<PathBuf>,
    pub magic_string: Option<String>,
    /// Humantime string such as `"5m"` or `"90s"`.
    pub time_interval: Option<String>,
    pub scan_policy: Option<ScanPolicy>,
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

/// Error body with a status derived from the crate error.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<crate::Error> for ApiError {
    fn from(err: crate::Error) -> Self {
        let status = match &err {
            crate::Error::Config(_) => StatusCode::BAD_REQUEST,
            crate::Error::Storage(StorageError::NotFound { .. }) => StatusCode::NOT_FOUND,
            crate::Error::Watcher(WatcherError::Registration { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            crate::Error::Watcher(WatcherError::Dispatch(_)) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "Request failed");
        } else {
            tracing::debug!(status = %self.status, error = %self.message, "Request rejected");
        }
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Create the REST router.
pub fn create_rest_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .route("/task-run", get(latest_run))
        .route("/runs", get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/configure", post(configure))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/scan", post(scan))
        .with_state(state)
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_status = match state.db.health_check() {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!(error = %e, "Database health check failed");
            "error"
        }
    };

    let response = HealthResponse {
        status: if db_status == "ok" {
            "healthy"
        } else {
            "unhealthy"
        }
        .to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: db_status.to_string(),
    };

    let status_code = if db_status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(response))
}

/// Prometheus metrics endpoint.
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    ENGINE_RUNNING.set(i64::from(state.engine.is_running()));

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                b"Failed to encode metrics".to_vec(),
            )
        }
    }
}

async fn status(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let counts = state.db.with_conn(|conn| {
        Ok(serde_json::json!({
            "total": crate::storage::count_runs(conn)?,
            "inProgress": crate::storage::count_runs_by_status(conn, RunStatus::InProgress)?,
            "success": crate::storage::count_runs_by_status(conn, RunStatus::Success)?,
            "failed": crate::storage::count_runs_by_status(conn, RunStatus::Failed)?,
        }))
    })?;
    let stats: DispatchStatsSnapshot = state.engine.stats();

    Ok(Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "running": state.engine.is_running(),
        "settings": SettingsResponse::from(state.engine.settings()),
        "runs": counts,
        "dispatch": stats,
    })))
}

async fn latest_run(State(state): State<AppState>) -> ApiResult<Json<RunResponse>> {
    let run = state
        .engine
        .latest_run()?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "no task run recorded yet"))?;
    Ok(Json(run.into()))
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Json<Vec<RunResponse>>> {
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).min(MAX_RUN_LIMIT);
    let runs = state
        .db
        .with_conn(|conn| crate::storage::list_runs(conn, limit))?;
    Ok(Json(runs.into_iter().map(RunResponse::from).collect()))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<RunResponse>> {
    let run = state
        .db
        .with_conn(|conn| crate::storage::get_run(conn, id))?
        .ok_or_else(|| StorageError::not_found("task_run", id.to_string()))
        .map_err(crate::Error::from)?;
    Ok(Json(run.into()))
}

async fn configure(
    State(state): State<AppState>,
    Json(request): Json<ConfigureRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut settings = state.engine.settings();

    if let Some(directory) = request.directory {
        settings.directory = directory;
    }
    if let Some(marker) = request.magic_string {
        settings.marker = marker;
    }
    if let Some(interval) = request.time_interval {
        settings.scan_interval = humantime::parse_duration(&interval).map_err(|e| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("invalid timeInterval {interval:?}: {e}"),
            )
        })?;
    }
    if let Some(policy) = request.scan_policy {
        settings.scan_policy = policy;
    }

    let restart_needed = state.engine.reconfigure(settings)?;

    Ok(Json(serde_json::json!({
        "settings": SettingsResponse::from(state.engine.settings()),
        "restartNeeded": restart_needed,
    })))
}

async fn start(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let engine = Arc::clone(&state.engine);
    let started = tokio::task::spawn_blocking(move || engine.start())
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;

    Ok(Json(serde_json::json!({ "running": true, "changed": started })))
}

async fn stop(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let engine = Arc::clone(&state.engine);
    let stopped = tokio::task::spawn_blocking(move || engine.stop())
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(serde_json::json!({ "running": false, "changed": stopped })))
}

async fn scan(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let engine = Arc::clone(&state.engine);
    let queued = tokio::task::spawn_blocking(move || engine.rescan())
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;

    Ok(Json(serde_json::json!({ "queued": queued })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{create_run, init_storage};
    use crate::watcher::ManualSource;
    use axum::body::Body;
    use axum::http::Request;
    use parking_lot::RwLock;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        _tmp: TempDir,
        state: AppState,
    }

    fn create_test_app() -> TestApp {
        let tmp = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        init_storage(&db).unwrap();

        let settings = Arc::new(RwLock::new(WatchSettings {
            directory: tmp.path().to_path_buf(),
            ..WatchSettings::default()
        }));
        let source = ManualSource::new();
        let engine = Engine::with_backend(db.clone(), settings, source.factory());

        TestApp {
            _tmp: tmp,
            state: AppState::new(db, Arc::new(engine)),
        }
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = create_rest_router(app.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_request(uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn seed_run(app: &TestApp, hits: u64) -> i64 {
        app.state
            .db
            .with_conn(|conn| {
                let mut run = TaskRun::begin(RunTrigger::Scan).with_hits(hits);
                run.status = RunStatus::Success;
                run.end_time = Some(run.start_time);
                create_run(conn, &run)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_test_app();
        let (status, body) = send(&app, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"], "ok");
    }

    #[tokio::test]
    async fn test_metrics() {
        let app = create_test_app();
        let response = create_rest_router(app.state.clone())
            .oneshot(get_request("/metrics"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_report_loop_that_ended_on_its_own() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        init_storage(&db).unwrap();
        let settings = Arc::new(RwLock::new(WatchSettings {
            directory: tmp.path().to_path_buf(),
            ..WatchSettings::default()
        }));
        let source = ManualSource::new();
        let engine = Arc::new(Engine::with_backend(db.clone(), settings, source.factory()));
        let app = TestApp {
            _tmp: tmp,
            state: AppState::new(db, Arc::clone(&engine)),
        };

        engine.start().unwrap();
        source.disconnect();
        for _ in 0..250 {
            if !engine.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!engine.is_running());

        let response = create_rest_router(app.state.clone())
            .oneshot(get_request("/metrics"))
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("dirwatch_engine_running 0"));
    }

    #[tokio::test]
    async fn test_task_run_not_found_when_empty() {
        let app = create_test_app();
        let (status, body) = send(&app, get_request("/task-run")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_task_run_returns_latest() {
        let app = create_test_app();
        seed_run(&app, 1);
        let id = seed_run(&app, 4);

        let (status, body) = send(&app, get_request("/task-run")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], id);
        assert_eq!(body["magicStringHits"], 4);
        assert_eq!(body["status"], "success");
        assert_eq!(body["filesAdded"], serde_json::json!([]));
        assert_eq!(body["runtime"], 0.0);
    }

    #[tokio::test]
    async fn test_runs_listing_and_lookup() {
        let app = create_test_app();
        let first = seed_run(&app, 1);
        seed_run(&app, 2);
        seed_run(&app, 3);

        let (status, body) = send(&app, get_request("/runs?limit=2")).await;
        assert_eq!(status, StatusCode::OK);
        let runs = body.as_array().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0]["magicStringHits"], 3);

        let (status, body) = send(&app, get_request(&format!("/runs/{first}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["magicStringHits"], 1);

        let (status, _) = send(&app, get_request("/runs/999")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_configure_updates_settings() {
        let app = create_test_app();
        let request = serde_json::json!({
            "magicString": "found you",
            "timeInterval": "90s",
            "scanPolicy": "fresh",
        });

        let (status, body) = send(&app, post_request("/configure", &request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["settings"]["magicString"], "found you");
        assert_eq!(body["settings"]["timeInterval"], "1m 30s");
        assert_eq!(body["restartNeeded"], false);

        let settings = app.state.engine.settings();
        assert_eq!(settings.scan_interval, Duration::from_secs(90));
        assert_eq!(settings.scan_policy, ScanPolicy::Fresh);
    }

    #[tokio::test]
    async fn test_configure_rejects_bad_input() {
        let app = create_test_app();

        let (status, _) = send(
            &app,
            post_request("/configure", &serde_json::json!({ "timeInterval": "soon" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            post_request("/configure", &serde_json::json!({ "magicString": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_start_stop_and_status() {
        let app = create_test_app();

        let (status, body) = send(&app, post_request("/start", &serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], true);

        let (_, body) = send(&app, get_request("/status")).await;
        assert_eq!(body["running"], true);
        assert_eq!(body["runs"]["total"], 0);

        let (status, body) = send(&app, post_request("/stop", &serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], true);
        assert!(!app.state.engine.is_running());
    }

    #[tokio::test]
    async fn test_scan_conflicts_when_stopped() {
        let app = create_test_app();
        let (status, _) = send(&app, post_request("/scan", &serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_start_missing_directory_unprocessable() {
        let app = create_test_app();
        let (status, _) = send(
            &app,
            post_request(
                "/configure",
                &serde_json::json!({ "directory": "/nonexistent/dirwatch" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&app, post_request("/start", &serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
