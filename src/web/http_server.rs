//! HTTP control surface
//!
//! Health, status and join/leave endpoints on top of one
//! [`ViewerConnectionManager`].

use crate::config::HttpConfig;
use crate::webrtc::{ConnectionState, MediaKind, ViewerConnectionManager, ViewerError, ViewerStatus};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

/// State shared by every handler
pub struct AppState {
    pub manager: Arc<ViewerConnectionManager>,
    started: Instant,
}

impl AppState {
    pub fn new(manager: Arc<ViewerConnectionManager>) -> Self {
        Self {
            manager,
            started: Instant::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest {
    stream_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TrackView {
    id: String,
    kind: MediaKind,
    codec: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaView {
    id: String,
    tracks: Vec<TrackView>,
}

/// JSON shape of `GET /status`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    state: ConnectionState,
    connecting: bool,
    stream_id: Option<String>,
    session_id: Option<String>,
    attempt_count: u32,
    max_attempts: u32,
    media: Option<MediaView>,
    last_error: Option<String>,
}

impl From<&ViewerStatus> for StatusView {
    fn from(status: &ViewerStatus) -> Self {
        Self {
            state: status.state,
            connecting: status.state.is_connecting(),
            stream_id: status.stream_id.clone(),
            session_id: status.session_id.clone(),
            attempt_count: status.attempt_count,
            max_attempts: status.max_attempts,
            media: status.media.as_ref().map(|media| MediaView {
                id: media.id().to_string(),
                tracks: media
                    .tracks()
                    .iter()
                    .map(|t| TrackView {
                        id: t.id.clone(),
                        kind: t.kind,
                        codec: t.codec.clone(),
                    })
                    .collect(),
            }),
            last_error: status.last_error.clone(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/join", post(join_handler))
        .route("/leave", post(leave_handler))
        .with_state(state)
}

/// Serve the control surface until the listener fails
pub async fn run_http_server(config: &HttpConfig, manager: Arc<ViewerConnectionManager>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let app = router(Arc::new(AppState::new(manager)));

    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP control surface listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> String {
    format!(
        r#"{{
  "status": "healthy",
  "uptime_seconds": {:.2},
  "state": "{}",
  "version": "{}"
}}"#,
        state.started.elapsed().as_secs_f64(),
        state.manager.state().as_str(),
        env!("CARGO_PKG_VERSION")
    )
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusView> {
    Json(StatusView::from(&state.manager.status()))
}

async fn join_handler(State(state): State<Arc<AppState>>, Json(request): Json<JoinRequest>) -> Response {
    match state.manager.join(&request.stream_id).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(StatusView::from(&state.manager.status()))).into_response(),
        Err(e @ ViewerError::InvalidStreamId(_)) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response()
        }
        Err(e) => {
            warn!("Join request failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn leave_handler(State(state): State<Arc<AppState>>) -> Json<StatusView> {
    state.manager.leave().await;
    Json(StatusView::from(&state.manager.status()))
}
