//! Authenticated WebSocket upgrade endpoint.

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;
use crate::ws::client;
use crate::ws::envelope::MAX_FRAME_SIZE;

/// Auth is via query param: `GET /ws?token=<jwt>`.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: String,
}

/// WebSocket upgrade endpoint. The credential is validated before the
/// upgrade; a bad token refuses the handshake with 401 and no client is ever
/// constructed. On success the connection pumps run until the socket dies.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.auth.validate(&params.token).await {
        Ok(user_id) => {
            tracing::info!(%user_id, "websocket connection authenticated");
            let hub = state.hub.clone();
            ws.max_message_size(MAX_FRAME_SIZE)
                .max_frame_size(MAX_FRAME_SIZE)
                .on_upgrade(move |socket| client::run_connection(socket, hub, user_id))
        }
        Err(err) => {
            tracing::warn!(error = %err, "websocket auth failed, refusing upgrade");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}
