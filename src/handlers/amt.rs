use axum::extract::{Path, State};
use axum::Json;

use crate::models::AnalysisModuleType;
use crate::utils::{CoreError, CoreResult};
use crate::AppState;

/// Register (or re-register) an analysis module type.
pub async fn register_amt(
    State(state): State<AppState>,
    Json(amt): Json<AnalysisModuleType>,
) -> CoreResult<Json<AnalysisModuleType>> {
    tracing::info!("module type registration request: {}", amt);
    state.registry.register_analysis_module_type(&amt).await?;

    let registered = state
        .registry
        .get_analysis_module_type(&amt.name)
        .await?
        .ok_or_else(|| CoreError::UnknownAnalysisModuleType(amt.name.clone()))?;
    Ok(Json(registered))
}

/// Fetch a registered module type by name.
pub async fn get_amt(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> CoreResult<Json<AnalysisModuleType>> {
    let amt = state
        .registry
        .get_analysis_module_type(&name)
        .await?
        .ok_or_else(|| CoreError::UnknownAnalysisModuleType(name))?;
    Ok(Json(amt))
}

/// Unregister a module type, discarding its queue, tracked requests and
/// cached results.
pub async fn delete_amt(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> CoreResult<Json<serde_json::Value>> {
    if !state.registry.delete_analysis_module_type(&name).await? {
        return Err(CoreError::UnknownAnalysisModuleType(name));
    }

    Ok(Json(serde_json::json!({ "deleted": name })))
}
