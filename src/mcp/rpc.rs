//! JSON-RPC 2.0 envelope codec
//!
//! Decodes raw text frames into typed envelopes and encodes them back, and maps
//! relay and application failures onto the fixed JSON-RPC error code table.

use std::fmt;

use serde::{
    ser::{SerializeMap, Serializer},
    Deserialize, Serialize,
};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::errors::AppError;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ToolNotConnected,
    ForwardFailed,
    ConnectionError,
    AuthenticationError,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ToolNotConnected => -32001,
            Self::ForwardFailed => -32002,
            Self::ConnectionError => -32003,
            Self::AuthenticationError => -32004,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::ToolNotConnected => "Tool not connected",
            Self::ForwardFailed => "Forward failed",
            Self::ConnectionError => "Connection error",
            Self::AuthenticationError => "Authentication error",
        }
    }
}

/// A request id as allowed on the wire: integer or string. Integers above
/// `i64::MAX` are kept as `Unsigned` so they round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Unsigned(u64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Unsigned(value) => write!(f, "{value}"),
            Self::String(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.message().to_string(),
            data: None,
        }
    }

    pub fn with_data(code: ErrorCode, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::new(code)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(ErrorObject),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<RequestId>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("frame is not valid JSON")]
    Parse,
    #[error("invalid JSON-RPC envelope: {reason}")]
    Invalid {
        id: Option<RequestId>,
        reason: &'static str,
    },
}

impl DecodeError {
    /// The error envelope a peer receives for an undecodable frame.
    pub fn to_response(&self) -> Envelope {
        match self {
            Self::Parse => error_response(None, ErrorObject::new(ErrorCode::ParseError)),
            Self::Invalid { id, reason } => error_response(
                id.clone(),
                ErrorObject::with_data(ErrorCode::InvalidRequest, json!({ "detail": reason })),
            ),
        }
    }
}

impl Envelope {
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(request) => Some(&request.method),
            Self::Notification(notification) => Some(&notification.method),
            Self::Response(_) => None,
        }
    }

    pub fn encode(&self) -> String {
        // Serializing a map of plain JSON values cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        match self {
            Self::Request(request) => {
                map.serialize_entry("id", &request.id)?;
                map.serialize_entry("method", &request.method)?;
                if let Some(params) = &request.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Self::Notification(notification) => {
                map.serialize_entry("method", &notification.method)?;
                if let Some(params) = &notification.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Self::Response(response) => {
                map.serialize_entry("id", &response.id)?;
                match &response.outcome {
                    Outcome::Result(result) => map.serialize_entry("result", result)?,
                    Outcome::Error(error) => map.serialize_entry("error", error)?,
                }
            }
        }
        map.end()
    }
}

pub fn decode(frame: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(frame).map_err(|_| DecodeError::Parse)?;
    decode_value(value)
}

pub fn decode_value(value: Value) -> Result<Envelope, DecodeError> {
    let mut object = match value {
        Value::Object(object) => object,
        Value::Array(_) => {
            return Err(invalid(None, "batch requests are not supported"));
        }
        _ => return Err(invalid(None, "envelope must be a JSON object")),
    };

    let id = match object.remove("id") {
        None => None,
        Some(raw) => Some(parse_id(raw).ok_or_else(|| invalid(None, "invalid id"))?),
    };
    // `null` is only meaningful as a response id
    let request_id = id.clone().flatten();

    if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(invalid(request_id, "jsonrpc must be \"2.0\""));
    }

    let method = match object.remove("method") {
        None => None,
        Some(Value::String(method)) if !method.trim().is_empty() => Some(method),
        Some(_) => return Err(invalid(request_id, "method must be a non-empty string")),
    };
    let params = object.remove("params");

    match (method, id) {
        (Some(method), Some(Some(id))) => Ok(Envelope::Request(Request { id, method, params })),
        (Some(_), Some(None)) => Err(invalid(None, "request id must not be null")),
        (Some(method), None) => Ok(Envelope::Notification(Notification { method, params })),
        (None, id) => decode_response(&mut object, id.flatten()),
    }
}

fn decode_response(
    object: &mut Map<String, Value>,
    id: Option<RequestId>,
) -> Result<Envelope, DecodeError> {
    let outcome = match (object.remove("result"), object.remove("error")) {
        (Some(result), None) => Outcome::Result(result),
        (None, Some(error)) => {
            let error: ErrorObject = serde_json::from_value(error)
                .map_err(|_| invalid(id.clone(), "malformed error object"))?;
            Outcome::Error(error)
        }
        (Some(_), Some(_)) => {
            return Err(invalid(id, "response must not carry both result and error"));
        }
        (None, None) => {
            return Err(invalid(id, "message has neither method nor result/error"));
        }
    };

    Ok(Envelope::Response(Response { id, outcome }))
}

/// `Some(None)` is an explicit `null` id.
fn parse_id(raw: Value) -> Option<Option<RequestId>> {
    match raw {
        Value::Null => Some(None),
        Value::String(value) => Some(Some(RequestId::String(value))),
        Value::Number(number) => number
            .as_i64()
            .map(RequestId::Number)
            .or_else(|| number.as_u64().map(RequestId::Unsigned))
            .map(Some),
        _ => None,
    }
}

fn invalid(id: Option<RequestId>, reason: &'static str) -> DecodeError {
    DecodeError::Invalid { id, reason }
}

pub fn result_response(id: RequestId, result: Value) -> Envelope {
    Envelope::Response(Response {
        id: Some(id),
        outcome: Outcome::Result(result),
    })
}

pub fn error_response(id: Option<RequestId>, error: ErrorObject) -> Envelope {
    Envelope::Response(Response {
        id,
        outcome: Outcome::Error(error),
    })
}

pub fn notification(method: &str, params: Option<Value>) -> Envelope {
    Envelope::Notification(Notification {
        method: method.to_string(),
        params,
    })
}

pub fn app_error_to_json_rpc(id: Option<RequestId>, err: AppError) -> Envelope {
    match err {
        AppError::Unauthorized { code, message } => error_response(
            id,
            ErrorObject::with_data(
                ErrorCode::AuthenticationError,
                json!({
                    "code": code,
                    "message": message,
                }),
            ),
        ),
        AppError::Internal { .. } => error_response(id, ErrorObject::new(ErrorCode::InternalError)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_request_notification_and_response() {
        let request = decode(r#"{"jsonrpc":"2.0","method":"get_weather","params":{"city":"Beijing"},"id":1}"#)
            .expect("request decodes");
        assert_eq!(
            request,
            Envelope::Request(Request {
                id: RequestId::Number(1),
                method: "get_weather".to_string(),
                params: Some(json!({"city": "Beijing"})),
            })
        );

        let notification = decode(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .expect("notification decodes");
        assert!(matches!(notification, Envelope::Notification(ref n) if n.method == "notifications/initialized"));

        let response = decode(r#"{"jsonrpc":"2.0","id":"abc","result":{"ok":true}}"#)
            .expect("response decodes");
        assert_eq!(
            response,
            Envelope::Response(Response {
                id: Some(RequestId::String("abc".to_string())),
                outcome: Outcome::Result(json!({"ok": true})),
            })
        );
    }

    #[test]
    fn error_response_with_null_id_decodes() {
        let decoded = decode(r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#)
            .expect("error response decodes");
        let Envelope::Response(response) = decoded else {
            panic!("expected response");
        };
        assert_eq!(response.id, None);
        assert_eq!(
            response.outcome,
            Outcome::Error(ErrorObject::new(ErrorCode::ParseError))
        );
    }

    #[test]
    fn invalid_json_is_parse_error() {
        assert_eq!(decode("{not json"), Err(DecodeError::Parse));
        assert_eq!(
            DecodeError::Parse.to_response().encode(),
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#
        );
    }

    #[test]
    fn structural_problems_are_invalid_requests() {
        let wrong_version = decode(r#"{"jsonrpc":"1.0","method":"x","id":7}"#).unwrap_err();
        assert!(matches!(
            wrong_version,
            DecodeError::Invalid { id: Some(RequestId::Number(7)), .. }
        ));

        let batch = decode(r#"[{"jsonrpc":"2.0","method":"x","id":1}]"#).unwrap_err();
        assert!(matches!(batch, DecodeError::Invalid { id: None, .. }));

        let float_id = decode(r#"{"jsonrpc":"2.0","method":"x","id":1.5}"#).unwrap_err();
        assert!(matches!(float_id, DecodeError::Invalid { .. }));

        let both = decode(r#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":1,"message":"m"}}"#)
            .unwrap_err();
        assert!(matches!(both, DecodeError::Invalid { .. }));

        let neither = decode(r#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert!(matches!(neither, DecodeError::Invalid { .. }));

        let response = wrong_version.to_response();
        let encoded: Value = serde_json::from_str(&response.encode()).expect("valid json");
        assert_eq!(encoded["id"], 7);
        assert_eq!(encoded["error"]["code"], -32600);
    }

    #[test]
    fn ids_beyond_i64_round_trip_unchanged() {
        let frame = r#"{"jsonrpc":"2.0","id":18446744073709551615,"method":"get_weather"}"#;
        let request = decode(frame).expect("large integer id is valid");
        assert_eq!(
            request,
            Envelope::Request(Request {
                id: RequestId::Unsigned(u64::MAX),
                method: "get_weather".to_string(),
                params: None,
            })
        );
        assert_eq!(request.encode(), frame);

        let small = decode(r#"{"jsonrpc":"2.0","id":-3,"method":"x"}"#).expect("negative id");
        assert!(matches!(
            small,
            Envelope::Request(Request { id: RequestId::Number(-3), .. })
        ));
    }

    #[test]
    fn encodes_tool_not_connected_exactly() {
        let envelope = error_response(
            Some(RequestId::Number(1)),
            ErrorObject::new(ErrorCode::ToolNotConnected),
        );
        assert_eq!(
            envelope.encode(),
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32001,"message":"Tool not connected"}}"#
        );
    }

    #[test]
    fn encodes_request_with_string_id() {
        let envelope = Envelope::Request(Request {
            id: RequestId::String("conn:n:1".to_string()),
            method: "get_weather".to_string(),
            params: Some(json!({"city": "Beijing"})),
        });
        assert_eq!(
            envelope.encode(),
            r#"{"jsonrpc":"2.0","id":"conn:n:1","method":"get_weather","params":{"city":"Beijing"}}"#
        );
    }

    #[test]
    fn error_codes_match_table() {
        let table = [
            (ErrorCode::ParseError, -32700),
            (ErrorCode::InvalidRequest, -32600),
            (ErrorCode::MethodNotFound, -32601),
            (ErrorCode::InvalidParams, -32602),
            (ErrorCode::InternalError, -32603),
            (ErrorCode::ToolNotConnected, -32001),
            (ErrorCode::ForwardFailed, -32002),
            (ErrorCode::ConnectionError, -32003),
            (ErrorCode::AuthenticationError, -32004),
        ];
        for (code, expected) in table {
            assert_eq!(code.code(), expected);
        }
    }

    #[test]
    fn unauthorized_maps_to_authentication_error() {
        let envelope = app_error_to_json_rpc(
            None,
            AppError::unauthorized("invalid_token", "invalid bearer token"),
        );
        let encoded: Value = serde_json::from_str(&envelope.encode()).expect("valid json");
        assert_eq!(encoded["id"], Value::Null);
        assert_eq!(encoded["error"]["code"], -32004);
        assert_eq!(encoded["error"]["data"]["code"], "invalid_token");
    }

    #[test]
    fn validator_failure_maps_to_internal_error_without_detail() {
        let envelope = app_error_to_json_rpc(None, AppError::internal("key store unreachable"));
        let encoded: Value = serde_json::from_str(&envelope.encode()).expect("valid json");
        assert_eq!(encoded["error"]["code"], -32603);
        assert!(encoded["error"].get("data").is_none());
    }
}
