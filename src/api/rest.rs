//! Axum REST API handlers
//!
//! Thin serving surface over the stream manager: start/stop/list plus the
//! MJPEG feed endpoint.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::StreamError;
use crate::service::{StreamInfo, StreamManager};

/// Application state shared across handlers.
pub struct AppState {
    pub manager: Arc<StreamManager>,
}

/// Create the REST API router.
pub fn create_rest_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/streams", post(start_stream_handler).get(list_streams_handler))
        .route("/api/v1/streams/:stream_id", delete(stop_stream_handler))
        .route("/api/v1/streams/:stream_id/feed", get(feed_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct StartStreamRequest {
    pub source: String,
    /// Minutes until the stream auto-stops; -1 disables expiry; omitted
    /// picks the configured default.
    pub lifetime_minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct StopStreamResponse {
    pub stopped: bool,
}

#[derive(Debug, Serialize)]
pub struct ListStreamsResponse {
    pub count: usize,
    pub streams: Vec<StreamInfo>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_status(err: &StreamError) -> StatusCode {
    match err {
        StreamError::ServiceBusy => StatusCode::SERVICE_UNAVAILABLE,
        StreamError::NotFound(_) => StatusCode::NOT_FOUND,
    }
}

fn error_reply(err: StreamError) -> (StatusCode, Json<ErrorResponse>) {
    (
        error_status(&err),
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

async fn start_stream_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartStreamRequest>,
) -> Result<(StatusCode, Json<StreamInfo>), (StatusCode, Json<ErrorResponse>)> {
    state
        .manager
        .start(request.source, request.lifetime_minutes)
        .await
        .map(|info| (StatusCode::CREATED, Json(info)))
        .map_err(|err| {
            error!("failed to start stream: {err}");
            error_reply(err)
        })
}

async fn list_streams_handler(State(state): State<Arc<AppState>>) -> Json<ListStreamsResponse> {
    let streams = state.manager.list();
    Json(ListStreamsResponse {
        count: streams.len(),
        streams,
    })
}

async fn stop_stream_handler(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Result<Json<StopStreamResponse>, (StatusCode, Json<ErrorResponse>)> {
    if state.manager.stop(&stream_id).await {
        Ok(Json(StopStreamResponse { stopped: true }))
    } else {
        Err(error_reply(StreamError::NotFound(stream_id)))
    }
}

async fn feed_handler(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let feed = state.manager.feed(&stream_id).map_err(error_reply)?;
    let body = Body::from_stream(feed.map(Ok::<_, Infallible>));

    Ok((
        [(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        body,
    )
        .into_response())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
