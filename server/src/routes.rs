use axum::{extract::State, routing::get, Json, Router};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the axum Router: the realtime upgrade endpoint and a health check.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/websocket", get(ws_handler::ws_upgrade))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health: liveness plus current fan-out size.
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.registry.len(),
        "scopes": state.registry.scopes().scope_count(),
    }))
}
