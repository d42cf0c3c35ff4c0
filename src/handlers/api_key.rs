use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::utils::{self, CoreResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
}

pub async fn create_api_key(
    State(state): State<AppState>,
    Json(request): Json<CreateApiKeyRequest>,
) -> CoreResult<Json<serde_json::Value>> {
    let api_key = utils::create_api_key(&state.db, &request.name, request.is_admin).await?;
    Ok(Json(serde_json::json!({ "name": request.name, "api_key": api_key })))
}

pub async fn list_api_keys(
    State(state): State<AppState>,
) -> CoreResult<Json<Vec<utils::ApiKey>>> {
    let keys = utils::list_api_keys(&state.db).await?;
    Ok(Json(keys))
}

pub async fn delete_api_key(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> CoreResult<Json<serde_json::Value>> {
    let deleted = utils::delete_api_key(&state.db, &name).await?;
    Ok(Json(serde_json::json!({ "name": name, "deleted": deleted })))
}
