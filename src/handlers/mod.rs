pub mod alert;
pub mod amt;
pub mod api_key;
pub mod process;
pub mod work_queue;

use axum::middleware as axum_middleware;
use axum::routing::{delete, get, post};
use axum::Router;

use crate::middleware::{auth_middleware, AuthState};
use crate::AppState;

/// Builds the remote façade: authenticated core routes, admin-only
/// key-lifecycle and alert-system routes, and an unauthenticated health
/// probe.
pub fn router(state: AppState) -> Router {
    let auth_state = AuthState { db: state.db.clone(), admin_required: false };
    let admin_state = AuthState { db: state.db.clone(), admin_required: true };

    let core_routes = Router::new()
        .route("/amt", post(amt::register_amt))
        .route("/amt/:name", get(amt::get_amt).delete(amt::delete_amt))
        .route("/process_request", post(process::process_request))
        .route("/work_queue", post(work_queue::get_work))
        .route("/root/:uuid", get(process::get_root))
        .route("/analysis_details/:uuid", get(process::get_analysis_details))
        .route("/alert_system/:name/alerts", get(alert::get_alerts))
        .with_state(state.clone())
        .layer(axum_middleware::from_fn_with_state(auth_state, auth_middleware));

    let admin_routes = Router::new()
        .route("/alert_system", post(alert::register_alert_system))
        .route("/alert_system/:name", delete(alert::unregister_alert_system))
        .route("/api_key", post(api_key::create_api_key).get(api_key::list_api_keys))
        .route("/api_key/:name", delete(api_key::delete_api_key))
        .with_state(state)
        .layer(axum_middleware::from_fn_with_state(admin_state, auth_middleware));

    let health_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(core_routes)
        .merge(admin_routes)
        .merge(health_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
}

async fn health_check() -> &'static str {
    "OK"
}
