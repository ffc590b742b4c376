//! REST handlers around the chat hub and message history.

use axum::{
    Json,
    extract::{Path, State},
};
use log::info;
use serde::{Deserialize, Serialize};

use crate::auth::CurrentUser;
use crate::chat::{Identity, PresenceEntry, WireMessage, send_direct};
use crate::history::StoredMessage;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Live chat connections.
    pub connections: usize,
}

/// Health check endpoint.
///
/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (status, connections) = match state.hub.online().await {
        Ok(online) => ("ok", online.len()),
        Err(_) => ("degraded", 0),
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections,
    })
}

/// Who is connected right now.
///
/// GET /api/chat/online
pub async fn online(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> ApiResult<Json<Vec<PresenceEntry>>> {
    Ok(Json(state.hub.online().await?))
}

/// Conversation between the caller and `peer_id`.
///
/// GET /api/chat/history/{peer_id}
pub async fn history_with(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(peer_id): Path<String>,
) -> ApiResult<Json<Vec<StoredMessage>>> {
    let messages = state.history.find_between(user.id(), &peer_id).await?;
    Ok(Json(messages))
}

/// Conversation between two identities. Admins may read any conversation;
/// everyone else only their own.
///
/// GET /api/chat/history/{user_a}/{user_b}
pub async fn history_between(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((user_a, user_b)): Path<(String, String)>,
) -> ApiResult<Json<Vec<StoredMessage>>> {
    if !user.is_admin() && user.id() != user_a && user.id() != user_b {
        return Err(ApiError::forbidden(
            "Only participants or admins can read this conversation",
        ));
    }

    let messages = state.history.find_between(&user_a, &user_b).await?;
    Ok(Json(messages))
}

/// Request body for a server-side direct message.
#[derive(Debug, Deserialize)]
pub struct DirectMessageRequest {
    pub message: String,
}

/// Outcome of a server-side direct message.
#[derive(Debug, Serialize)]
pub struct DirectMessageResponse {
    pub delivered: bool,
    pub message: WireMessage,
}

/// Send a direct message without holding a websocket.
///
/// POST /api/chat/direct/{recipient_id}
pub async fn direct_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(recipient_id): Path<String>,
    Json(request): Json<DirectMessageRequest>,
) -> ApiResult<Json<DirectMessageResponse>> {
    if request.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }
    if recipient_id.trim().is_empty() {
        return Err(ApiError::bad_request("recipient id must not be empty"));
    }

    let sender = Identity::try_from(&user.claims)?;
    let outcome = send_direct(
        &state.hub,
        state.history.as_ref(),
        &sender,
        &recipient_id,
        request.message,
    )
    .await?;

    info!(
        "Direct message {} from {} to {} via REST (delivered: {})",
        outcome.message.id, sender.user_id, recipient_id, outcome.delivered
    );

    Ok(Json(DirectMessageResponse {
        delivered: outcome.delivered,
        message: outcome.message,
    }))
}
