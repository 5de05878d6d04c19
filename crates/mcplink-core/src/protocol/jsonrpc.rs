//! JSON-RPC 2.0 envelopes
//!
//! Requests, responses and notifications as typed values. Decoding goes
//! through [`JsonRpcMessage::from_value`], which classifies a payload and
//! rejects malformed envelopes with [`McpError::ProtocolViolation`].

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::McpError;

/// Protocol version string carried in every envelope
pub const JSONRPC_VERSION: &str = "2.0";

/// The `"jsonrpc": "2.0"` marker
///
/// Serializes to the literal version string and refuses anything else on the
/// way in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version2;

impl Serialize for Version2 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for Version2 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version = String::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(Version2)
        } else {
            Err(de::Error::custom(format!(
                "unsupported jsonrpc version '{}'",
                version
            )))
        }
    }
}

/// Request identifier: a string or an integer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

impl RequestId {
    fn from_value(value: &Value) -> Result<Self, McpError> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(RequestId::Number)
                .ok_or_else(|| McpError::protocol(format!("request id {} is not an integer", n))),
            Value::String(s) => Ok(RequestId::String(s.clone())),
            other => Err(McpError::protocol(format!(
                "request id must be a string or integer, got {}",
                other
            ))),
        }
    }
}

/// JSON-RPC error codes
///
/// The reserved codes get names; everything in the implementation-defined
/// server range or outside the reserved block is kept verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum RpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    /// -32000..=-32099
    ServerError(i64),
    /// Application-defined code outside the reserved range
    Application(i64),
}

impl RpcErrorCode {
    pub fn code(self) -> i64 {
        match self {
            RpcErrorCode::ParseError => -32700,
            RpcErrorCode::InvalidRequest => -32600,
            RpcErrorCode::MethodNotFound => -32601,
            RpcErrorCode::InvalidParams => -32602,
            RpcErrorCode::InternalError => -32603,
            RpcErrorCode::ServerError(code) | RpcErrorCode::Application(code) => code,
        }
    }

    fn label(self) -> Option<&'static str> {
        match self {
            RpcErrorCode::ParseError => Some("parse error"),
            RpcErrorCode::InvalidRequest => Some("invalid request"),
            RpcErrorCode::MethodNotFound => Some("method not found"),
            RpcErrorCode::InvalidParams => Some("invalid params"),
            RpcErrorCode::InternalError => Some("internal error"),
            RpcErrorCode::ServerError(_) => Some("server error"),
            RpcErrorCode::Application(_) => None,
        }
    }
}

impl From<i64> for RpcErrorCode {
    fn from(code: i64) -> Self {
        match code {
            -32700 => RpcErrorCode::ParseError,
            -32600 => RpcErrorCode::InvalidRequest,
            -32601 => RpcErrorCode::MethodNotFound,
            -32602 => RpcErrorCode::InvalidParams,
            -32603 => RpcErrorCode::InternalError,
            -32099..=-32000 => RpcErrorCode::ServerError(code),
            _ => RpcErrorCode::Application(code),
        }
    }
}

impl From<RpcErrorCode> for i64 {
    fn from(code: RpcErrorCode) -> Self {
        code.code()
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label() {
            Some(label) => write!(f, "{} ({})", self.code(), label),
            None => write!(f, "{}", self.code()),
        }
    }
}

/// Error member of a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: RpcErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Version2,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// `Some(Value::Null)` params are stored as absent
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version2,
            id,
            method: method.into(),
            params: params.filter(|p| !p.is_null()),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, McpError> {
        match JsonRpcMessage::from_value(value)? {
            JsonRpcMessage::Request(request) => Ok(request),
            other => Err(McpError::protocol(format!(
                "expected a request, got {}",
                other.kind()
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        JsonRpcRequest::from_value(value).map_err(de::Error::custom)
    }
}

/// JSON-RPC notification (never carries an id)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: Version2,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version2,
            method: method.into(),
            params: params.filter(|p| !p.is_null()),
        }
    }

    /// Decode a notification, rejecting payloads that carry an `id`
    pub fn from_value(value: Value) -> Result<Self, McpError> {
        let object = envelope_object(&value)?;
        if object.contains_key("id") {
            return Err(McpError::protocol_with_raw(
                "notification must not carry an id",
                &value,
            ));
        }
        match JsonRpcMessage::from_value(value)? {
            JsonRpcMessage::Notification(notification) => Ok(notification),
            other => Err(McpError::protocol(format!(
                "expected a notification, got {}",
                other.kind()
            ))),
        }
    }

    /// String parameter lookup, used for routing by `uri` or `taskId`
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.as_ref()?.get(key)?.as_str()
    }
}

impl<'de> Deserialize<'de> for JsonRpcNotification {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        JsonRpcNotification::from_value(value).map_err(de::Error::custom)
    }
}

/// Result or error, never both and never neither
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(RpcErrorObject),
}

/// JSON-RPC response
///
/// `id` is only absent on error responses to requests the server could not
/// parse far enough to read an id from.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub id: Option<RequestId>,
    pub outcome: ResponseOutcome,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: ResponseOutcome::Result(result),
        }
    }

    pub fn failure(id: Option<RequestId>, error: RpcErrorObject) -> Self {
        Self {
            id,
            outcome: ResponseOutcome::Error(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ResponseOutcome::Error(_))
    }
}

impl Serialize for JsonRpcResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("jsonrpc", &Version2)?;
        map.serialize_entry("id", &self.id)?;
        match &self.outcome {
            ResponseOutcome::Result(result) => map.serialize_entry("result", result)?,
            ResponseOutcome::Error(error) => map.serialize_entry("error", error)?,
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for JsonRpcResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match JsonRpcMessage::from_value(value).map_err(de::Error::custom)? {
            JsonRpcMessage::Response(response) => Ok(response),
            other => Err(de::Error::custom(format!(
                "expected a response, got {}",
                other.kind()
            ))),
        }
    }
}

/// Any inbound or outbound JSON-RPC payload
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Parse raw text into a classified message
    pub fn parse(text: &str) -> Result<Self, McpError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| McpError::ProtocolViolation {
                message: format!("invalid JSON: {}", e),
                raw: Some(text.to_string()),
            })?;
        Self::from_value(value)
    }

    /// Classify and validate a JSON value
    pub fn from_value(value: Value) -> Result<Self, McpError> {
        let object = envelope_object(&value)?;

        match object.get("jsonrpc") {
            None => return Err(McpError::protocol_with_raw("missing \"jsonrpc\" member", &value)),
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(other) => {
                return Err(McpError::protocol_with_raw(
                    format!("unsupported jsonrpc version {}", other),
                    &value,
                ))
            }
        }

        if let Some(method) = object.get("method") {
            let method = method
                .as_str()
                .ok_or_else(|| McpError::protocol_with_raw("method must be a string", &value))?
                .to_string();
            let params = match object.get("params") {
                None | Some(Value::Null) => None,
                Some(p @ (Value::Object(_) | Value::Array(_))) => Some(p.clone()),
                Some(_) => {
                    return Err(McpError::protocol_with_raw(
                        "params must be an object or array",
                        &value,
                    ))
                }
            };
            return match object.get("id") {
                Some(id) => Ok(JsonRpcMessage::Request(JsonRpcRequest {
                    jsonrpc: Version2,
                    id: RequestId::from_value(id)?,
                    method,
                    params,
                })),
                None => Ok(JsonRpcMessage::Notification(JsonRpcNotification {
                    jsonrpc: Version2,
                    method,
                    params,
                })),
            };
        }

        let id = match object.get("id") {
            None => return Err(McpError::protocol_with_raw("response is missing an id", &value)),
            Some(Value::Null) => None,
            Some(id) => Some(RequestId::from_value(id)?),
        };

        let outcome = match (object.get("result"), object.get("error")) {
            (Some(_), Some(_)) => {
                return Err(McpError::protocol_with_raw(
                    "response carries both result and error",
                    &value,
                ))
            }
            (None, None) => {
                return Err(McpError::protocol_with_raw(
                    "response carries neither result nor error",
                    &value,
                ))
            }
            (Some(result), None) => {
                if id.is_none() {
                    return Err(McpError::protocol_with_raw(
                        "successful response must carry an id",
                        &value,
                    ));
                }
                ResponseOutcome::Result(result.clone())
            }
            (None, Some(error)) => {
                let error: RpcErrorObject = serde_json::from_value(error.clone()).map_err(|e| {
                    McpError::protocol_with_raw(format!("malformed error object: {}", e), &value)
                })?;
                ResponseOutcome::Error(error)
            }
        };

        Ok(JsonRpcMessage::Response(JsonRpcResponse { id, outcome }))
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            JsonRpcMessage::Response(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JsonRpcMessage::Request(_) => "request",
            JsonRpcMessage::Response(_) => "response",
            JsonRpcMessage::Notification(_) => "notification",
        }
    }
}

impl Serialize for JsonRpcMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcMessage::Request(r) => r.serialize(serializer),
            JsonRpcMessage::Response(r) => r.serialize(serializer),
            JsonRpcMessage::Notification(n) => n.serialize(serializer),
        }
    }
}

fn envelope_object(value: &Value) -> Result<&Map<String, Value>, McpError> {
    match value {
        Value::Object(object) => Ok(object),
        Value::Array(_) => Err(McpError::protocol_with_raw(
            "batched messages are not supported",
            value,
        )),
        _ => Err(McpError::protocol_with_raw(
            "JSON-RPC message must be an object",
            value,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn is_violation(result: Result<JsonRpcMessage, McpError>) -> bool {
        matches!(result, Err(McpError::ProtocolViolation { .. }))
    }

    #[test]
    fn test_request_serialization_omits_absent_params() {
        let request = JsonRpcRequest::new(RequestId::Number(7), "ping", None);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json, json!({"jsonrpc": "2.0", "id": 7, "method": "ping"}));
    }

    #[test]
    fn test_string_ids_survive() {
        let msg = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":"abc","result":{}}"#).unwrap();
        match msg {
            JsonRpcMessage::Response(r) => assert_eq!(r.id, Some(RequestId::from("abc"))),
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_response_with_both_result_and_error_rejected() {
        let raw = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {},
            "error": {"code": -32603, "message": "boom"}
        });
        assert!(is_violation(JsonRpcMessage::from_value(raw)));
    }

    #[test]
    fn test_response_with_neither_result_nor_error_rejected() {
        let raw = json!({"jsonrpc": "2.0", "id": 1});
        assert!(is_violation(JsonRpcMessage::from_value(raw)));
    }

    #[test]
    fn test_null_result_counts_as_present() {
        let msg = JsonRpcMessage::from_value(json!({"jsonrpc": "2.0", "id": 1, "result": null}))
            .unwrap();
        assert_eq!(
            msg,
            JsonRpcMessage::Response(JsonRpcResponse::success(RequestId::Number(1), Value::Null))
        );
    }

    #[test]
    fn test_missing_jsonrpc_rejected() {
        assert!(is_violation(JsonRpcMessage::from_value(
            json!({"id": 1, "result": {}})
        )));
        assert!(is_violation(JsonRpcMessage::from_value(
            json!({"jsonrpc": "1.0", "id": 1, "result": {}})
        )));
    }

    #[test]
    fn test_notification_with_id_rejected() {
        let raw = json!({"jsonrpc": "2.0", "id": 3, "method": "notifications/progress"});
        let err = JsonRpcNotification::from_value(raw).unwrap_err();
        assert!(matches!(err, McpError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_classifies_request_and_notification() {
        let request = JsonRpcMessage::from_value(
            json!({"jsonrpc": "2.0", "id": 9, "method": "sampling/createMessage", "params": {}}),
        )
        .unwrap();
        assert_eq!(request.kind(), "request");

        let notification = JsonRpcMessage::from_value(
            json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}),
        )
        .unwrap();
        assert_eq!(notification.kind(), "notification");
        assert_eq!(notification.method(), Some("notifications/tools/list_changed"));
    }

    #[test]
    fn test_error_response_round_trip() {
        let response = JsonRpcResponse::failure(
            Some(RequestId::Number(4)),
            RpcErrorObject {
                code: RpcErrorCode::MethodNotFound,
                message: "Method not found".to_string(),
                data: None,
            },
        );
        let text = serde_json::to_string(&response).unwrap();
        assert!(!text.contains("data"));
        let decoded: JsonRpcResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_request_round_trip() {
        let request = JsonRpcRequest::new(
            RequestId::Number(1),
            "tools/call",
            Some(json!({"name": "echo", "arguments": {"text": "hi"}})),
        );
        let text = serde_json::to_string(&request).unwrap();
        let decoded: JsonRpcRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_null_params_are_dropped() {
        let request = JsonRpcRequest::new(RequestId::Number(1), "ping", Some(Value::Null));
        assert_eq!(request.params, None);
        let text = serde_json::to_string(&request).unwrap();
        assert!(!text.contains("params"));
        let decoded: JsonRpcRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, request);

        let notification =
            JsonRpcNotification::new("notifications/initialized", Some(Value::Null));
        assert_eq!(notification.params, None);
    }

    #[test]
    fn test_request_rejects_scalar_params() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"method":"ping","params":5}"#;
        assert!(serde_json::from_str::<JsonRpcRequest>(raw).is_err());
        assert!(serde_json::from_str::<JsonRpcRequest>(
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#
        )
        .is_err());
    }

    #[test]
    fn test_notification_round_trip() {
        let notification = JsonRpcNotification::new(
            "notifications/resources/updated",
            Some(json!({"uri": "file:///a.txt"})),
        );
        let text = serde_json::to_string(&notification).unwrap();
        let decoded: JsonRpcNotification = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, notification);
        assert_eq!(decoded.param_str("uri"), Some("file:///a.txt"));
    }

    #[test]
    fn test_success_response_round_trip() {
        let response = JsonRpcResponse::success(
            RequestId::from("req-9"),
            json!({"tools": [], "nextCursor": null}),
        );
        let text = serde_json::to_string(&response).unwrap();
        let decoded: JsonRpcResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, response);

        let null_result = JsonRpcResponse::success(RequestId::Number(2), Value::Null);
        let text = serde_json::to_string(&null_result).unwrap();
        assert_eq!(serde_json::from_str::<JsonRpcResponse>(&text).unwrap(), null_result);
    }

    #[test]
    fn test_error_codes_map_to_names() {
        assert_eq!(RpcErrorCode::from(-32601), RpcErrorCode::MethodNotFound);
        assert_eq!(RpcErrorCode::from(-32050), RpcErrorCode::ServerError(-32050));
        assert_eq!(RpcErrorCode::from(42), RpcErrorCode::Application(42));
        assert_eq!(RpcErrorCode::Application(42).code(), 42);
        assert_eq!(RpcErrorCode::InvalidParams.to_string(), "-32602 (invalid params)");
    }

    #[test]
    fn test_null_id_only_allowed_on_errors() {
        let parse_error = json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": -32700, "message": "Parse error"}
        });
        assert!(JsonRpcMessage::from_value(parse_error).is_ok());

        let bad = json!({"jsonrpc": "2.0", "id": null, "result": {}});
        assert!(is_violation(JsonRpcMessage::from_value(bad)));
    }

    #[test]
    fn test_batches_rejected() {
        assert!(is_violation(JsonRpcMessage::parse("[]")));
        assert!(is_violation(JsonRpcMessage::parse("not json")));
    }
}
