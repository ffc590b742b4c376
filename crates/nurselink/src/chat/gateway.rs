//! Websocket entry point for chat clients.

use axum::{
    extract::{State, WebSocketUpgrade, ws::WebSocket},
    response::Response,
};
use log::{info, warn};

use crate::api::{ApiError, AppState};
use crate::auth::CurrentUser;

use super::connection::Connection;
use super::types::Identity;

/// WebSocket upgrade handler.
///
/// GET /api/chat/ws
///
/// The auth middleware has already verified the credential. The claims must
/// still name a display name and a role before a connection is admitted.
pub async fn ws_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let identity = Identity::try_from(&user.claims)?;
    info!(
        "Chat upgrade request from user {} ({})",
        identity.user_id, identity.role
    );

    Ok(ws.on_upgrade(move |socket| serve_connection(socket, identity, state)))
}

async fn serve_connection(socket: WebSocket, identity: Identity, state: AppState) {
    let (conn, handle) = Connection::new(
        identity,
        state.hub.clone(),
        state.history.clone(),
        &state.chat,
    );

    if let Err(e) = state.hub.register(handle).await {
        warn!("Rejecting chat connection {}: {}", conn.id(), e);
        return;
    }

    conn.run(socket).await;
}
