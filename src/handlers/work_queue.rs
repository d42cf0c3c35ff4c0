use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::models::AnalysisModuleType;
use crate::utils::CoreError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WorkQueueRequest {
    pub owner: String,
    pub amt: String,
    #[serde(default)]
    pub timeout: u64,
    pub version: String,
    #[serde(default)]
    pub extended_version: Vec<String>,
}

/// Worker entry point: claim the next analysis request for the module type.
/// Returns 204 when no work is available within the timeout. A stale
/// version or extended version is refused so the worker upgrades first.
pub async fn get_work(
    State(state): State<AppState>,
    Json(request): Json<WorkQueueRequest>,
) -> Result<Response, CoreError> {
    let mut amt = AnalysisModuleType::new(&request.amt);
    amt.version = request.version;
    amt.extended_version = request.extended_version;

    let next = state
        .engine
        .get_next_analysis_request(&request.owner, &amt, Duration::from_secs(request.timeout))
        .await?;

    match next {
        Some(analysis_request) => Ok(Json(analysis_request).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}
