use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// GET /healthz — liveness check.
async fn healthz() -> &'static str {
    "ok"
}

/// GET /api/users/online — snapshot of currently-connected user ids.
async fn online_users(State(state): State<AppState>) -> Json<Value> {
    let online = state.hub.list_online().await;
    let count = online.len();
    Json(json!({ "users": online, "count": count }))
}

/// Build the axum Router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler::ws_upgrade))
        .route("/healthz", get(healthz))
        .route("/api/users/online", get(online_users))
        .with_state(state)
}
