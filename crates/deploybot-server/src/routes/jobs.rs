use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::StreamExt as _;
use uuid::Uuid;

use deploybot_core::job::JobCreate;
use deploybot_core::logbroker::LogEvent;
use deploybot_core::types::JobStatus;

use crate::error::AppError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// POST /v1/jobs — create directly
// ---------------------------------------------------------------------------

pub async fn create(
    State(app): State<AppState>,
    Json(req): Json<JobCreate>,
) -> Result<impl IntoResponse, AppError> {
    let job = app.queue.enqueue(req, app.clock.now())?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "job": job }))))
}

// ---------------------------------------------------------------------------
// GET /v1/jobs — list, optionally filtered by status
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    status: Option<String>,
}

pub async fn list(
    State(app): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let filter = params
        .status
        .as_deref()
        .map(|s| s.parse::<JobStatus>())
        .transpose()?;
    let jobs = app.store.list_jobs(filter)?;
    Ok(Json(serde_json::json!({ "jobs": jobs })))
}

// ---------------------------------------------------------------------------
// GET /v1/jobs/{job_id}
// ---------------------------------------------------------------------------

pub async fn get(
    State(app): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let job = app
        .store
        .get_job(job_id)?
        .ok_or_else(|| AppError::not_found(format!("job '{job_id}' not found")))?;
    Ok(Json(serde_json::json!({ "job": job })))
}

// ---------------------------------------------------------------------------
// DELETE /v1/jobs/{job_id} — admin cancel
// ---------------------------------------------------------------------------

pub async fn cancel(
    State(app): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let job = app.dispatcher.cancel(job_id)?;
    Ok(Json(serde_json::json!({ "job": job })))
}

// ---------------------------------------------------------------------------
// GET /v1/jobs/{job_id}/logs/stream — SSE subscription
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    from_sequence: u64,
}

/// SSE events: `chunk` (JSON log chunk), `close` (terminal sentinel), and
/// `dropped` (this subscriber fell behind and was unregistered).
pub async fn stream_logs(
    State(app): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(params): Query<StreamParams>,
) -> Result<impl IntoResponse, AppError> {
    let stream = app.broker.subscribe(job_id, params.from_sequence)?;
    let events = stream.map(|event| {
        Ok::<Event, Infallible>(match event {
            LogEvent::Chunk(chunk) => Event::default()
                .event("chunk")
                .data(serde_json::to_string(&chunk).unwrap_or_default()),
            LogEvent::Dropped => Event::default().event("dropped").data("subscriber dropped"),
            LogEvent::Closed => Event::default().event("close").data("end"),
        })
    });

    // Disable proxy buffering (nginx honors x-accel-buffering) so events
    // are forwarded immediately instead of being held until a buffer fills.
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store"),
    );
    headers.insert(
        header::HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    Ok((headers, Sse::new(events).keep_alive(KeepAlive::default())))
}
