use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// POST /v1/webhooks/github — push ingress.
///
/// The raw body is verified against `X-Hub-Signature-256` before anything is
/// parsed; a mismatch is 401 with no side effects.
pub async fn github(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    let event_type = headers.get("x-github-event").and_then(|v| v.to_str().ok());

    let created = app.translator.ingest(&body, signature, event_type)?;
    Ok(Json(serde_json::json!({
        "received": true,
        "jobs_created": created,
        "message": format!("created {} deployment job(s)", created.len()),
    })))
}
