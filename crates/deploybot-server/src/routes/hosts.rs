use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /v1/hosts — one row per hostname, newest registration wins, with the
/// derived liveness status.
pub async fn list(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let hosts = app.registry.hosts()?;
    Ok(Json(serde_json::json!({ "hosts": hosts })))
}
