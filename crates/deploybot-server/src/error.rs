use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use deploybot_core::DeployError;

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

/// A handler-level rejection with an explicit status, for errors that do not
/// originate in the core (bad path params, unknown ack statuses).
#[derive(Debug)]
struct Rejection {
    status: StatusCode,
    message: String,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Rejection {}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(anyhow::Error::new(Rejection {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self(anyhow::Error::new(Rejection {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self(anyhow::Error::new(Rejection {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if let Some(r) = self.0.downcast_ref::<Rejection>() {
            r.status
        } else if let Some(e) = self.0.downcast_ref::<DeployError>() {
            match e {
                DeployError::SignatureInvalid => StatusCode::UNAUTHORIZED,
                DeployError::DuplicateIdempotency(_)
                | DeployError::NotClaimable(_)
                | DeployError::NotAssignedToYou { .. }
                | DeployError::AlreadyTerminal(_) => StatusCode::CONFLICT,
                DeployError::AgentUnknown(_)
                | DeployError::JobNotFound(_)
                | DeployError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                DeployError::InvalidStatus(_) | DeployError::Json(_) | DeployError::Yaml(_) => {
                    StatusCode::BAD_REQUEST
                }
                DeployError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
                DeployError::Config(_) | DeployError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            }
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
