use axum::extract::State;
use axum::Json;

use crate::state::AppState;

/// GET /health — liveness probe.
pub async fn health(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": app.clock.now().to_rfc3339(),
    }))
}
