use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tracing::warn;

use super::ApiState;
use crate::errors::AppError;

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub url: String,
}

/// GET /api/v1/token: the current registration token, renewed through
/// the single-flight cache when stale.
pub async fn get_token(State(state): State<ApiState>) -> Result<Json<TokenResponse>, AppError> {
    let token = state.reg_token.get().await.map_err(|err| {
        warn!(error = %err, "failed to get registration token");
        AppError::InternalServerError(err.to_string())
    })?;

    Ok(Json(TokenResponse {
        token,
        url: state.target.url(),
    }))
}
