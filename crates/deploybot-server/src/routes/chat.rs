//! Chat session persistence surface. The assistant that produces replies is
//! an external collaborator; these routes only manage the stored sessions
//! and transcripts.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use deploybot_core::chat::{ChatMessage, ChatSession};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

pub async fn create_session(
    State(app): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let session = ChatSession::new(
        req.user_id.unwrap_or_else(|| "default".to_string()),
        req.name,
        app.clock.now(),
    );
    app.store.upsert_chat_session(&session)?;
    Ok((StatusCode::CREATED, Json(session)))
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsParams {
    #[serde(default = "default_user")]
    user_id: String,
    #[serde(default)]
    include_archived: bool,
}

fn default_user() -> String {
    "default".to_string()
}

pub async fn list_sessions(
    State(app): State<AppState>,
    Query(params): Query<ListSessionsParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let sessions = app
        .store
        .list_chat_sessions(&params.user_id, params.include_archived)?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

pub async fn get_session(
    State(app): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ChatSession>, AppError> {
    let session = app
        .store
        .get_chat_session(session_id)?
        .ok_or_else(|| AppError::not_found(format!("session '{session_id}' not found")))?;
    Ok(Json(session))
}

pub async fn delete_session(
    State(app): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    app.store.delete_chat_session(session_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn archive_session(
    State(app): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ChatSession>, AppError> {
    let session = app
        .store
        .set_chat_archived(session_id, true, app.clock.now())?;
    Ok(Json(session))
}

pub async fn unarchive_session(
    State(app): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ChatSession>, AppError> {
    let session = app
        .store
        .set_chat_archived(session_id, false, app.clock.now())?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub role: String,
    pub content: String,
}

pub async fn post_message(
    State(app): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<PostMessageRequest>,
) -> Result<impl IntoResponse, AppError> {
    let message = ChatMessage::new(session_id, req.role, req.content, app.clock.now());
    app.store.append_chat_message(&message)?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn list_messages(
    State(app): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    if app.store.get_chat_session(session_id)?.is_none() {
        return Err(AppError::not_found(format!(
            "session '{session_id}' not found"
        )));
    }
    let messages = app.store.list_chat_messages(session_id)?;
    Ok(Json(serde_json::json!({ "messages": messages })))
}
