//! JSON read API, the SSE event stream, and the admin upload endpoint.
//!
//! Rendering is someone else's job: every response here is JSON (or an SSE
//! stream of JSON envelopes), consumed by the web frontend.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, warn};

use crate::events::EventBus;
use crate::ingest::{Ingest, IngestError};
use crate::store::Store;

/// Header carrying the shared admin secret for uploads.
const ADMIN_PASSCODE_HEADER: &str = "x-admin-passcode";
/// Entries returned by the leaderboard endpoint.
const LEADERBOARD_LIMIT: usize = 50;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub bus: EventBus,
    pub ingest: Arc<Ingest>,
    pub admin_passcode: String,
}

/// Build the arena router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/leaderboard", get(leaderboard))
        .route("/api/rating-history/:player", get(rating_history))
        .route("/api/matches", get(recent_matches))
        .route("/api/users", get(users))
        .route("/api/submissions/:username", get(user_submissions).post(upload))
        .route("/events/updates", get(updates))
        .with_state(state)
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, axum::Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        error!("request failed: {e:#}");
        ApiError(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
        )
    }
}

async fn leaderboard(State(state): State<AppState>) -> Result<Response, ApiError> {
    let entries = state.store.leaderboard(LEADERBOARD_LIMIT)?;
    Ok(axum::Json(entries).into_response())
}

async fn rating_history(
    State(state): State<AppState>,
    Path(player): Path<String>,
) -> Result<Response, ApiError> {
    match state.store.rating_history(&player)? {
        Some(history) => Ok(axum::Json(history).into_response()),
        None => Err(ApiError(
            StatusCode::NOT_FOUND,
            "player not found".to_string(),
        )),
    }
}

async fn recent_matches(State(state): State<AppState>) -> Result<Response, ApiError> {
    let matches = state.store.recent_matches()?;
    Ok(axum::Json(matches).into_response())
}

async fn users(State(state): State<AppState>) -> Result<Response, ApiError> {
    let users = state.store.all_users()?;
    Ok(axum::Json(users).into_response())
}

async fn user_submissions(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, ApiError> {
    let submissions = state.store.user_submissions(&username)?;
    Ok(axum::Json(submissions).into_response())
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    filename: String,
}

/// Admin upload override: the SSH transport is the normal path, but the
/// passcode holder may submit on behalf of any user over HTTP.
async fn upload(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let presented = headers
        .get(ADMIN_PASSCODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != state.admin_passcode {
        return Err(ApiError(
            StatusCode::UNAUTHORIZED,
            "invalid admin passcode".to_string(),
        ));
    }

    match state.ingest.accept(&username, &params.filename, &body) {
        Ok(id) => Ok((StatusCode::CREATED, axum::Json(json!({ "id": id }))).into_response()),
        Err(e @ (IngestError::InvalidFilename | IngestError::InvalidUsername)) => Err(ApiError(
            StatusCode::UNPROCESSABLE_ENTITY,
            e.to_string(),
        )),
        Err(IngestError::Internal(e)) => Err(e.into()),
    }
}

/// SSE stream of arena events as single JSON objects.
///
/// A subscriber that cannot keep up loses the oldest events (logged, not
/// fatal); publishers are never blocked by a slow consumer.
async fn updates(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.bus.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|message| match message {
        Ok(event) => match Event::default().json_data(&event) {
            Ok(sse_event) => Some(Ok(sse_event)),
            Err(e) => {
                error!("failed to serialize event: {e}");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "SSE subscriber lagged, dropping events");
            None
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keep-alive"),
    )
}
