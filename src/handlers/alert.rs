use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::utils::CoreResult;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterAlertSystemRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct GetAlertsQuery {
    /// Seconds to wait for at least one alert; absent returns immediately.
    pub timeout: Option<u64>,
}

pub async fn register_alert_system(
    State(state): State<AppState>,
    Json(request): Json<RegisterAlertSystemRequest>,
) -> CoreResult<Json<serde_json::Value>> {
    let registered = state.alerts.register_alert_system(&request.name).await?;
    Ok(Json(serde_json::json!({ "name": request.name, "registered": registered })))
}

pub async fn unregister_alert_system(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> CoreResult<Json<serde_json::Value>> {
    let unregistered = state.alerts.unregister_alert_system(&name).await?;
    Ok(Json(serde_json::json!({ "name": name, "unregistered": unregistered })))
}

/// Drain the subscriber's alert queue, optionally blocking for up to
/// `timeout` seconds.
pub async fn get_alerts(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<GetAlertsQuery>,
) -> CoreResult<Json<Vec<String>>> {
    let timeout = query.timeout.map(Duration::from_secs);
    let alerts = state.alerts.get_alerts(&name, timeout).await?;
    Ok(Json(alerts))
}
