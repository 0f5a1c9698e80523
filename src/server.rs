use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    config::{ScanConfig, WorkerCount},
    controller::ScanController,
    errors::ScanError,
    inspector::ProbeHeaders,
    sink::{ScanEvent, Sinks},
    types::{ChannelRecord, ScanMode, StatsSnapshot},
};

const DEFAULT_TIMEOUT_S: f64 = 10.0;

#[derive(Clone)]
pub struct AppState {
    controller: Arc<ScanController>,
    inner: Arc<RwLock<ServerState>>, // folded sink events
}

#[derive(Debug, Default)]
struct ServerState {
    results: Vec<ChannelRecord>,
    processed: u64,
    total: u64,
    stats: Option<StatsSnapshot>,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct Status {
    pub state: String, // "idle" | "running" | "stopping" | "done"
    pub mode: Option<ScanMode>,
    pub processed: u64,
    pub total: u64,
    pub valid: u64,
    pub invalid: u64,
    pub elapsed_seconds: f64,
    pub active_probes: usize,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub template: String,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub timeout_s: Option<f64>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub referer: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    /// Addresses to re-probe; empty means "the invalid ones from the last session".
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub timeout_s: Option<f64>,
}

pub async fn spawn_server(bind: &str, config: ScanConfig) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("serving API on http://{}/api", listener.local_addr()?);
    axum::serve(listener, build_app(config)).await?;
    Ok(())
}

/// Router with its own controller and event folder. Must be called inside a runtime.
pub fn build_app(config: ScanConfig) -> Router {
    let (sinks, events) = Sinks::channel();
    let state = AppState {
        controller: Arc::new(ScanController::new(config, sinks)),
        inner: Arc::new(RwLock::new(ServerState::default())),
    };
    tokio::spawn(fold_events(events, state.inner.clone(), state.controller.clone()));

    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/validate", post(post_validate))
        .route("/stop", post(post_stop))
        .route("/results", get(get_results))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

/// Consume sink events on the runtime. A `(0, _)` progress marks a new session;
/// snapshots from a replaced session are dropped.
async fn fold_events(
    mut events: mpsc::UnboundedReceiver<ScanEvent>,
    inner: Arc<RwLock<ServerState>>,
    controller: Arc<ScanController>,
) {
    while let Some(event) = events.recv().await {
        let mut s = inner.write().await;
        match event {
            ScanEvent::Result(record) => s.results.push(record),
            ScanEvent::Progress { processed, total } => {
                if processed == 0 {
                    s.results.clear();
                    s.stats = None;
                }
                s.processed = processed;
                s.total = total;
            }
            ScanEvent::Stats(snapshot) => {
                if snapshot.session == controller.current_session() {
                    s.stats = Some(snapshot);
                }
            }
        }
    }
}

fn timeout_from(secs: Option<f64>) -> Duration {
    let secs = secs.filter(|s| s.is_finite() && *s > 0.0).unwrap_or(DEFAULT_TIMEOUT_S);
    Duration::from_secs_f64(secs)
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let controller = app.controller.clone();
    let s = app.inner.read().await;
    let running = controller.is_scanning();
    let state = match (&s.stats, running) {
        (_, true) => "running",
        (Some(st), false) if st.finished => "done",
        (None, false) if s.total == 0 => "idle",
        _ => "stopping",
    };
    let (valid, invalid, elapsed) = s
        .stats
        .as_ref()
        .map(|st| (st.valid, st.invalid, st.elapsed_seconds))
        .unwrap_or_default();
    let out = Status {
        state: state.into(),
        mode: controller.mode(),
        processed: s.processed,
        total: s.total,
        valid,
        invalid,
        elapsed_seconds: elapsed,
        active_probes: controller.active_probes(),
    };
    (StatusCode::OK, Json(out))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    if s.results.is_empty() {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::OK, Json(s.results.clone())).into_response()
    }
}

async fn post_scan(State(app): State<AppState>, Json(req): Json<ScanRequest>) -> impl IntoResponse {
    let headers = ProbeHeaders {
        user_agent: req.user_agent,
        referer: req.referer,
    };
    let workers = WorkerCount::from_flag(req.workers.unwrap_or(0));
    let timeout = timeout_from(req.timeout_s);
    let controller = app.controller.clone();
    let template = req.template;

    // Starting tears down any previous session, which may wait briefly on its workers.
    let res = tokio::task::spawn_blocking(move || {
        controller.start_scan(&template, workers, timeout, headers)
    })
    .await;
    started_response(res)
}

async fn post_validate(
    State(app): State<AppState>,
    Json(req): Json<ValidateRequest>,
) -> impl IntoResponse {
    let workers = WorkerCount::from_flag(req.workers.unwrap_or(0));
    let timeout = timeout_from(req.timeout_s);
    let controller = app.controller.clone();
    let addresses = if req.addresses.is_empty() {
        controller.invalid_addresses()
    } else {
        req.addresses
    };

    let res = tokio::task::spawn_blocking(move || {
        controller.start_validation(addresses, workers, timeout)
    })
    .await;
    started_response(res)
}

async fn post_stop(State(app): State<AppState>) -> impl IntoResponse {
    let controller = app.controller.clone();
    let res = tokio::task::spawn_blocking(move || {
        controller.stop_scan();
        controller.stop_validation();
    })
    .await;
    match res {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            error!("stop task failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn started_response(
    res: Result<Result<(), ScanError>, tokio::task::JoinError>,
) -> axum::response::Response {
    match res {
        Ok(Ok(())) => StatusCode::ACCEPTED.into_response(),
        Ok(Err(e @ (ScanError::RangeSyntax { .. } | ScanError::MaxRangeExceeded { .. }))) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Ok(Err(e)) => {
            error!("failed to start session: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            error!("start task failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
