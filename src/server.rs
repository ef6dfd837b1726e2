// HTTP surface: joystick page, command endpoint, status, video stream

use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{debug, warn};

use crate::camera::{FrameFeed, BOUNDARY};
use crate::control::CommandPipeline;
use crate::messages::{CommandRequest, CommandResponse, StatusReport};
use crate::status::TelemetryReader;

const INDEX_HTML: &str = include_str!("page.html");

/// Everything the handlers share
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<CommandPipeline>,
    pub telemetry: TelemetryReader,
    /// `None` when the camera is disabled
    pub frames: Option<Arc<FrameFeed>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/control", post(control))
        .route("/status", get(status))
        .route("/video_feed", get(video_feed))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn control(State(state): State<AppState>, body: Bytes) -> Json<CommandResponse> {
    let request = CommandRequest::from_body(&body).unwrap_or_else(|e| {
        // Anything we cannot read is a stop
        warn!("Unparseable control request ({}), stopping", e);
        CommandRequest::default()
    });
    debug!("Control request: {:?}", request);

    Json(state.pipeline.submit(&request, Instant::now()))
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.telemetry.latest().report())
}

async fn video_feed(State(state): State<AppState>) -> Response {
    let Some(frames) = &state.frames else {
        return (StatusCode::SERVICE_UNAVAILABLE, "camera disabled").into_response();
    };

    let content_type = format!("multipart/x-mixed-replace; boundary={}", BOUNDARY);
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(frames.viewer()),
    )
        .into_response()
}
