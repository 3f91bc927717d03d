use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use std::sync::Arc;

use crate::state::AppState;
use crate::store::{StoreError, UserId};
use crate::ws::transport::{CloseStatus, Transport, WebSocketTransport};

/// Cookie set by the REST backend at login.
pub const TOKEN_COOKIE: &str = "token";

/// Fallback for clients that cannot attach cookies to the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

fn session_token(jar: &CookieJar, query: WsAuthQuery) -> Option<String> {
    jar.get(TOKEN_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .or(query.token)
        .filter(|token| !token.is_empty())
}

/// GET /websocket
/// Authenticates from the `token` cookie (or `?token=`) before upgrading.
/// Unauthenticated requests are refused with 401 and never upgraded.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = session_token(&jar, query) else {
        tracing::warn!("WebSocket request without session token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let user_id = match state.auth.authenticate(&token).await {
        Ok(user_id) => user_id,
        Err(StoreError::Unauthorized | StoreError::NotFound(_)) => {
            tracing::warn!("WebSocket auth failed: unknown or expired token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "WebSocket auth lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    tracing::info!(user_id = user_id, "WebSocket connection authenticated");
    ws.on_upgrade(move |socket| handle_authenticated(socket, state, user_id))
}

/// Snapshot the user's servers and hand the socket to the registry.
async fn handle_authenticated(socket: WebSocket, state: AppState, user_id: UserId) {
    let transport: Arc<dyn Transport> = Arc::new(WebSocketTransport::new(socket));

    let scopes = match state.membership.scopes_of_user(user_id).await {
        Ok(scopes) => scopes,
        Err(e) => {
            tracing::error!(user_id = user_id, error = %e, "Membership lookup failed");
            let status = CloseStatus::InternalError;
            if let Err(e) = transport.close(status, status.reason()).await {
                tracing::debug!(error = %e, "Close after failed lookup");
            }
            return;
        }
    };

    state.registry.register(user_id, transport, scopes).await;
}
