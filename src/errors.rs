use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal server error: {0}")]
    InternalServerError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Carries the status code of a failed upstream call so DELETE
    /// /api/v1/runners/{id} can propagate what the target returned.
    #[error("Upstream error: {1}")]
    Upstream(StatusCode, String),
}

/// Helper for mapping any unknown error into internal error
pub fn internal_error<E: ToString>(err: E) -> AppError {
    AppError::InternalServerError(err.to_string())
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Upstream(status, _) => *status,
        };

        let body = Json(json!({
            "message": self.to_string()
        }));

        (status, body).into_response()
    }
}

/// Non-2xx response from a peer HTTP API (manager, controller, or target).
///
/// Kept as a distinct type so callers can downcast out of `anyhow` and
/// branch on the code, e.g. treating 404 as success-of-intent when
/// terminating an agent that is already gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unexpected status code: {0}")]
pub struct UnexpectedStatus(pub StatusCode);

impl UnexpectedStatus {
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<UnexpectedStatus>(),
            Some(UnexpectedStatus(StatusCode::NOT_FOUND))
        )
    }
}

/// Fails on any non-2xx response, preserving the status code.
pub fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, UnexpectedStatus> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(UnexpectedStatus(resp.status()))
    }
}
