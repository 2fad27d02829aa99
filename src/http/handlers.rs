//! Axum HTTP handlers for the web server
//!
//! Provides the provider and caller socket endpoints, and general metadata endpoints.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
    Json,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use serde::{Deserialize, Serialize};

use crate::auth::{authenticate, presented_token};
use crate::http::socket::{reject_connection, serve_connection};
use crate::mcp::handshake::SUPPORTED_PROTOCOL_VERSION;
use crate::relay::{RelayStats, Role};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: RelayStats,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub protocol_version: &'static str,
    pub provider_endpoint: String,
    pub caller_endpoint: String,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.dispatcher.stats(),
    })
}

pub async fn discovery(State(state): State<AppState>) -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        protocol_version: SUPPORTED_PROTOCOL_VERSION,
        provider_endpoint: state.provider_path.to_string(),
        caller_endpoint: state.caller_path.to_string(),
    })
}

pub async fn provider_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
) -> Response {
    upgrade(ws, state, Role::Provider, query, auth_header).await
}

pub async fn caller_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
) -> Response {
    upgrade(ws, state, Role::Caller, query, auth_header).await
}

/// Credentials are checked before the connection is registered. A rejected
/// peer still gets an upgraded socket so it can read the error envelope.
async fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    role: Role,
    query: TokenQuery,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
) -> Response {
    let token = presented_token(
        query.token.as_deref(),
        auth_header.as_ref().map(|TypedHeader(auth)| auth),
    );
    let verdict = authenticate(state.token_validator.as_ref(), token).await;
    let dispatcher = state.dispatcher.clone();

    ws.on_upgrade(move |socket| async move {
        match verdict {
            Ok(identity) => serve_connection(socket, dispatcher, role, identity).await,
            Err(err) => reject_connection(socket, role, err).await,
        }
    })
}
