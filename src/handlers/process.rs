use axum::extract::{Path, State};
use axum::Json;

use crate::models::{AnalysisRequest, RootAnalysis};
use crate::utils::{CoreError, CoreResult};
use crate::AppState;

/// Submit an analysis request (a root submission, or a worker's result) for
/// processing.
pub async fn process_request(
    State(state): State<AppState>,
    Json(request): Json<AnalysisRequest>,
) -> CoreResult<Json<serde_json::Value>> {
    let request_id = request.id.clone();
    tracing::info!("processing request submission {}", request);

    if request.is_observable_analysis_result() {
        // results keep their claimed owner so stale workers are refused
        state.engine.process_analysis_request(request).await?;
    } else {
        // root submissions process inline, plain observable requests queue
        state.engine.submit_analysis_request(request).await?;
    }

    Ok(Json(serde_json::json!({ "id": request_id })))
}

/// Fetch the authoritative root document; workers use this to refresh a
/// stale view.
pub async fn get_root(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> CoreResult<Json<RootAnalysis>> {
    let root = state
        .analysis_tracking
        .get_root_analysis(&uuid)
        .await?
        .ok_or_else(|| CoreError::UnknownRootAnalysis(uuid))?;
    Ok(Json(root))
}

/// Fetch the lazily-loaded detail blob of one analysis.
pub async fn get_analysis_details(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> CoreResult<Json<serde_json::Value>> {
    let details = state
        .analysis_tracking
        .get_analysis_details(&uuid)
        .await?
        .ok_or_else(|| CoreError::UnknownFile(uuid))?;
    Ok(Json(details))
}
