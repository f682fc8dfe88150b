use crate::emissions::{EmissionsTracker, FileEmissionsTracker};
use crate::error::{AppError, AppResult};
use crate::events::{EventStore, SqliteEventStore};
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub http: reqwest::Client,
    pub events: Arc<dyn EventStore>,
    pub tracker: Arc<dyn EmissionsTracker>,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub llama_base_url: String,
    pub llama_api_key: String,
    pub emissions_dir: String,
    pub events_dsn: String,
    pub events_table: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            listen: env_or("WATTRELAY_LISTEN", "0.0.0.0:8000"),
            metrics_path: env_or("WATTRELAY_METRICS_PATH", "/metrics"),
            llama_base_url: env_or("LLAMA_BASE_URL", "http://127.0.0.1:8080"),
            // llama.cpp accepts any bearer value
            llama_api_key: env_or("LLAMA_API_KEY", "dummy-key"),
            emissions_dir: env_or("EMISSIONS_DIR", "./emissions"),
            events_dsn: env_or("CHATUI_DATABASE_DSN", "sqlite://./data/chatui.db"),
            events_table: env_or("CHATUI_EVENTS_TABLE", "message_events"),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    // No overall request timeout: streamed generation runs as long as the
    // model keeps producing tokens.
    let http = reqwest::Client::builder()
        .user_agent("wattrelay/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let events = SqliteEventStore::new(&runtime.events_dsn, &runtime.events_table)
        .await
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "event_store_init_failed",
                err.to_string(),
            )
        })?;

    let tracker = FileEmissionsTracker::new(&runtime.emissions_dir).map_err(|err| {
        AppError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "emissions_init_failed",
            err.to_string(),
        )
    })?;

    let metrics = init_metrics()?;

    Ok(AppState {
        runtime: Arc::new(runtime),
        http,
        events: Arc::new(events),
        tracker: Arc::new(tracker),
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::new()
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/chat/completions",
            post(crate::handlers::chat_completions),
        )
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
