//! Connection lifecycle handshake
//!
//! Implements the fixed `initialize` / `notifications/initialized` exchange a
//! connection must complete before any business traffic is accepted.

use rust_mcp_sdk::schema::{
    Implementation, InitializeResult, ProtocolVersion, ServerCapabilities,
    ServerCapabilitiesTools,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::RelayError;
use crate::mcp::rpc::{error_response, result_response, ErrorCode, ErrorObject, Envelope, Request};
use crate::relay::registry::{ConnectionId, ConnectionRegistry, ConnectionState};

pub const SUPPORTED_PROTOCOL_VERSION: &str = "2024-11-05";

pub const INITIALIZE: &str = "initialize";
pub const INITIALIZED: &str = "notifications/initialized";
const INITIALIZED_ALIAS: &str = "initialized";
pub const PING: &str = "ping";

pub fn is_initialized_notification(method: &str) -> bool {
    method == INITIALIZED || method == INITIALIZED_ALIAS
}

/// The relay only speaks one protocol version. Whatever the peer offers, the
/// answer advertises that version and the peer decides whether to continue.
pub fn negotiate_protocol_version(params: Option<&Value>) -> ProtocolVersion {
    let offered_version = params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty());

    match offered_version {
        Some(SUPPORTED_PROTOCOL_VERSION) => {}
        Some(offered) => {
            info!(
                offered = %offered,
                supported = SUPPORTED_PROTOCOL_VERSION,
                "peer offered a different protocol version"
            );
        }
        None => warn!("initialize request did not offer a protocolVersion"),
    }

    ProtocolVersion::V2024_11_05
}

pub fn initialize_result(protocol_version: ProtocolVersion) -> Result<Value, serde_json::Error> {
    let initialize_result = InitializeResult {
        server_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
            description: None,
            icons: vec![],
            website_url: None,
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools {
                list_changed: Some(true),
            }),
            resources: None,
            prompts: None,
            ..Default::default()
        },
        protocol_version: protocol_version.into(),
        instructions: None,
        meta: None,
    };

    serde_json::to_value(initialize_result)
}

/// Answers `initialize` and moves the connection to `AwaitingInitialized`.
pub fn on_initialize(
    registry: &mut ConnectionRegistry,
    connection_id: &ConnectionId,
    request: &Request,
) -> Envelope {
    if let Err(err) = registry.transition(connection_id, ConnectionState::AwaitingInitialized) {
        warn!(connection_id = %connection_id, error = %err, "initialize rejected");
        return error_response(
            Some(request.id.clone()),
            ErrorObject::with_data(
                ErrorCode::InvalidRequest,
                json!({ "detail": "connection is already initialized" }),
            ),
        );
    }

    let protocol_version = negotiate_protocol_version(request.params.as_ref());
    match initialize_result(protocol_version) {
        Ok(result) => {
            info!(connection_id = %connection_id, "initialize answered");
            result_response(request.id.clone(), result)
        }
        Err(err) => {
            warn!(error = %err, "initialize result serialization failed");
            error_response(
                Some(request.id.clone()),
                ErrorObject::new(ErrorCode::InternalError),
            )
        }
    }
}

/// Moves the connection to `Ready`. Never produces a message for the peer.
pub fn on_initialized(
    registry: &mut ConnectionRegistry,
    connection_id: &ConnectionId,
) -> Result<(), RelayError> {
    registry.transition(connection_id, ConnectionState::Ready)?;
    info!(connection_id = %connection_id, "connection ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::mcp::rpc::{Outcome, RequestId, Response};
    use crate::relay::registry::Role;

    fn initialize_request(version: &str) -> Request {
        Request {
            id: RequestId::Number(1),
            method: INITIALIZE.to_string(),
            params: Some(json!({
                "protocolVersion": version,
                "clientInfo": {"name": "test-client", "version": "1.0.0"},
                "capabilities": {}
            })),
        }
    }

    #[test]
    fn negotiate_protocol_version_accepts_supported_version() {
        let params = json!({ "protocolVersion": SUPPORTED_PROTOCOL_VERSION });
        assert_eq!(
            negotiate_protocol_version(Some(&params)),
            ProtocolVersion::V2024_11_05
        );
    }

    #[test]
    fn negotiate_protocol_version_answers_unsupported_version_with_supported() {
        let params = json!({ "protocolVersion": "2026-01-01" });
        assert_eq!(
            negotiate_protocol_version(Some(&params)),
            ProtocolVersion::V2024_11_05
        );
        assert_eq!(negotiate_protocol_version(None), ProtocolVersion::V2024_11_05);
    }

    #[test]
    fn initialize_advertises_server_identity_and_tools() {
        let mut registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.register(Role::Caller, "default_agent", tx);

        let response = on_initialize(&mut registry, &id, &initialize_request("2026-01-01"));
        let Envelope::Response(Response {
            id: Some(RequestId::Number(1)),
            outcome: Outcome::Result(result),
        }) = response
        else {
            panic!("expected a result response");
        };

        assert_eq!(result["protocolVersion"], SUPPORTED_PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], env!("CARGO_PKG_NAME"));
        assert_eq!(result["serverInfo"]["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(result["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(
            registry.get(&id).expect("registered").state,
            ConnectionState::AwaitingInitialized
        );
    }

    #[test]
    fn repeated_initialize_is_invalid_request() {
        let mut registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.register(Role::Provider, "default_agent", tx);

        on_initialize(&mut registry, &id, &initialize_request(SUPPORTED_PROTOCOL_VERSION));
        let second = on_initialize(&mut registry, &id, &initialize_request(SUPPORTED_PROTOCOL_VERSION));

        let Envelope::Response(Response {
            outcome: Outcome::Error(error),
            ..
        }) = second
        else {
            panic!("expected an error response");
        };
        assert_eq!(error.code, -32600);
    }

    #[test]
    fn initialized_requires_initialize_first() {
        let mut registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.register(Role::Caller, "default_agent", tx);

        assert!(on_initialized(&mut registry, &id).is_err());
        on_initialize(&mut registry, &id, &initialize_request(SUPPORTED_PROTOCOL_VERSION));
        on_initialized(&mut registry, &id).expect("ready after initialize");
        assert_eq!(
            registry.get(&id).expect("registered").state,
            ConnectionState::Ready
        );
        assert!(is_initialized_notification("initialized"));
        assert!(is_initialized_notification(INITIALIZED));
    }
}
