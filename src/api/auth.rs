use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use crate::errors::AppError;

/// Static bearer keys guarding the manager API.
#[derive(Clone)]
pub struct AuthKeys(pub Vec<String>);

/// Checks the bearer token against every configured key in constant
/// time, accepting when any key matches.
pub async fn key_auth(
    State(AuthKeys(keys)): State<AuthKeys>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let token = match header.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token,
        _ => return Err(AppError::Unauthorized("invalid key".into())),
    };

    let mut matched = subtle::Choice::from(0u8);
    for key in &keys {
        matched |= key.as_bytes().ct_eq(token.as_bytes());
    }
    if !bool::from(matched) {
        return Err(AppError::Unauthorized("invalid key".into()));
    }

    Ok(next.run(request).await)
}
