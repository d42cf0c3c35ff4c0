use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use sqlx::SqlitePool;

use crate::utils::{verify_api_key, ApiKey, CoreError};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AuthState {
    pub db: SqlitePool,
    /// Admin-only routes (key lifecycle, alert system registration) run
    /// behind a second instance of this middleware with this set.
    pub admin_required: bool,
}

/// Bearer-style authentication via the `X-API-Key` header. The verified key
/// is inserted into the request extensions for downstream handlers.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, CoreError> {
    let api_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(CoreError::InvalidApiKey)?;

    let verified: ApiKey = verify_api_key(&state.db, api_key, state.admin_required).await?;
    tracing::debug!("authenticated api key {} for {}", verified.name, request.uri());

    request.extensions_mut().insert(verified);
    Ok(next.run(request).await)
}
