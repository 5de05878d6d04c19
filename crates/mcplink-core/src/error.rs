//! Error taxonomy for the MCP engine
//!
//! Every public operation returns one of these. Variants carry the method,
//! request id and raw server text so failures can be diagnosed without logs.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{RequestId, RpcErrorCode};
use crate::retry::IsRetryable;
use crate::session::SessionState;

/// Longest raw body kept on an error for diagnostics
const MAX_RAW_LEN: usize = 2048;

#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// HTTP or network failure
    #[error("transport error{}{}: {message}{}", for_method(.method), with_status(.status), with_body(.body))]
    Transport {
        method: Option<String>,
        status: Option<u16>,
        message: String,
        body: Option<String>,
    },

    /// The request did not complete within its deadline
    #[error("request '{method}'{} timed out after {timeout:?}", with_id(.id))]
    TransportTimeout {
        method: String,
        id: Option<RequestId>,
        timeout: Duration,
    },

    /// Malformed JSON-RPC envelope or payload
    #[error("protocol violation: {message}{}", with_body(.raw))]
    ProtocolViolation {
        message: String,
        raw: Option<String>,
    },

    /// Error reported by the server in a JSON-RPC response
    #[error("'{method}' (id {id}) failed with {code}: {message}")]
    Rpc {
        method: String,
        id: RequestId,
        code: RpcErrorCode,
        message: String,
        data: Option<Value>,
    },

    #[error("handshake failed after {attempts} attempt(s): {reason}")]
    HandshakeFailed { attempts: u32, reason: String },

    #[error("session closed")]
    SessionClosed,

    #[error("session is not connected (state: {state})")]
    NotConnected { state: SessionState },

    #[error("task {task_id} expired: no progress within {ttl:?}")]
    TaskExpired { task_id: String, ttl: Duration },

    #[error("task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    #[error("task {task_id} was cancelled")]
    TaskCancelled { task_id: String },

    /// A task-backed call needs caller input, which a synchronous call cannot supply
    #[error("task {task_id} requires input: {message}")]
    InputRequired { task_id: String, message: String },

    /// Local rejection, no request was sent
    #[error("'{method}' requires capability '{capability}', which was not negotiated")]
    CapabilityNotNegotiated {
        method: String,
        capability: &'static str,
    },

    #[error("request '{method}'{} was cancelled", with_id(.id))]
    Cancelled {
        method: String,
        id: Option<RequestId>,
    },

    /// Rejected client configuration; nothing was sent
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

fn for_method(method: &Option<String>) -> String {
    method
        .as_ref()
        .map(|m| format!(" in '{}'", m))
        .unwrap_or_default()
}

fn with_status(status: &Option<u16>) -> String {
    status
        .map(|s| format!(" (HTTP {})", s))
        .unwrap_or_default()
}

fn with_body(body: &Option<String>) -> String {
    match body {
        Some(b) if !b.trim().is_empty() => format!(" [body: {}]", b.trim()),
        _ => String::new(),
    }
}

fn with_id(id: &Option<RequestId>) -> String {
    id.as_ref()
        .map(|id| format!(" (id {})", id))
        .unwrap_or_default()
}

fn truncate_raw(raw: &str) -> String {
    if raw.len() <= MAX_RAW_LEN {
        return raw.to_string();
    }
    let mut end = MAX_RAW_LEN;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &raw[..end])
}

impl McpError {
    pub fn protocol(message: impl Into<String>) -> Self {
        McpError::ProtocolViolation {
            message: message.into(),
            raw: None,
        }
    }

    pub fn protocol_with_raw(message: impl Into<String>, raw: &Value) -> Self {
        McpError::ProtocolViolation {
            message: message.into(),
            raw: Some(truncate_raw(&raw.to_string())),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        McpError::Transport {
            method: None,
            status: None,
            message: message.into(),
            body: None,
        }
    }

    pub fn http_status(status: u16, body: &str) -> Self {
        McpError::Transport {
            method: None,
            status: Some(status),
            message: "unexpected HTTP status".to_string(),
            body: Some(truncate_raw(body)),
        }
    }

    pub fn unexpected_body(status: u16, message: impl Into<String>, body: &str) -> Self {
        McpError::Transport {
            method: None,
            status: Some(status),
            message: message.into(),
            body: Some(truncate_raw(body)),
        }
    }

    /// Fill in request context the lower layers could not know
    pub fn for_request(self, method: &str, request_id: &RequestId) -> Self {
        match self {
            McpError::Transport {
                method: None,
                status,
                message,
                body,
            } => McpError::Transport {
                method: Some(method.to_string()),
                status,
                message,
                body,
            },
            McpError::TransportTimeout {
                id: None, timeout, ..
            } => McpError::TransportTimeout {
                method: method.to_string(),
                id: Some(request_id.clone()),
                timeout,
            },
            McpError::Cancelled { id: None, .. } => McpError::Cancelled {
                method: method.to_string(),
                id: Some(request_id.clone()),
            },
            other => other,
        }
    }

    /// JSON-RPC code for server-reported errors
    pub fn rpc_code(&self) -> Option<RpcErrorCode> {
        match self {
            McpError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_session_closed(&self) -> bool {
        matches!(self, McpError::SessionClosed)
    }
}

impl IsRetryable for McpError {
    /// Transport-level failures and malformed replies are worth another try.
    /// Server-reported errors never are: repeating a call may repeat its side effects.
    fn is_retryable(&self) -> bool {
        match self {
            McpError::Transport { status, .. } => match status {
                None => true,
                Some(s) => *s == 408 || *s == 429 || *s >= 500,
            },
            McpError::TransportTimeout { .. } | McpError::ProtocolViolation { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(e: serde_json::Error) -> Self {
        McpError::protocol(format!("JSON encoding error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_carries_context_in_message() {
        let err = McpError::Rpc {
            method: "tools/frobnicate".to_string(),
            id: RequestId::Number(12),
            code: RpcErrorCode::MethodNotFound,
            message: "Method not found".to_string(),
            data: None,
        };
        let text = err.to_string();
        assert!(text.contains("tools/frobnicate"));
        assert!(text.contains("12"));
        assert!(text.contains("-32601"));
        assert_eq!(err.rpc_code(), Some(RpcErrorCode::MethodNotFound));
    }

    #[test]
    fn test_transport_error_shows_status_and_body() {
        let err = McpError::http_status(503, "upstream down").for_request("ping", &RequestId::Number(1));
        let text = err.to_string();
        assert!(text.contains("'ping'"));
        assert!(text.contains("HTTP 503"));
        assert!(text.contains("upstream down"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(McpError::transport("connection refused").is_retryable());
        assert!(McpError::http_status(502, "").is_retryable());
        assert!(!McpError::http_status(400, "").is_retryable());
        assert!(!McpError::SessionClosed.is_retryable());
        assert!(!McpError::InvalidConfig("bad url".to_string()).is_retryable());
        assert!(!McpError::Rpc {
            method: "initialize".to_string(),
            id: RequestId::Number(1),
            code: RpcErrorCode::InvalidParams,
            message: "bad".to_string(),
            data: None,
        }
        .is_retryable());
    }

    #[test]
    fn test_raw_bodies_are_truncated() {
        let long = "x".repeat(MAX_RAW_LEN * 2);
        match McpError::http_status(500, &long) {
            McpError::Transport { body: Some(body), .. } => assert!(body.len() < long.len()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
