//! Transport layer
//!
//! Moves JSON-RPC messages over HTTP: POST for client→server traffic, a
//! long-lived GET carrying SSE for server push, DELETE to end a session.

mod http;
pub mod sse;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::McpError;
use crate::protocol::{JsonRpcMessage, JsonRpcNotification, JsonRpcResponse};

pub use http::HttpTransport;
pub use sse::{decode_frames, SseDecoder, SseFrame};

pub const SESSION_HEADER: &str = "Mcp-Session-Id";
pub const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";
/// POST bodies may be answered with plain JSON or an SSE stream
pub const ACCEPT_POST: &str = "application/json, text/event-stream";
pub const ACCEPT_STREAM: &str = "text/event-stream";

/// Headers attached to every request once a session exists
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionHeaders {
    pub session_id: Option<String>,
    pub protocol_version: Option<String>,
}

/// What came back from a POST
#[derive(Debug, Clone, Default)]
pub struct PostReply {
    /// The response, or None when the server answered `202 Accepted`
    pub response: Option<JsonRpcResponse>,
    /// Notifications the server streamed ahead of the response
    pub notifications: Vec<JsonRpcNotification>,
    /// `Mcp-Session-Id` from the reply headers
    pub session_id: Option<String>,
}

impl PostReply {
    pub fn accepted(session_id: Option<String>) -> Self {
        Self {
            response: None,
            notifications: Vec::new(),
            session_id,
        }
    }
}

/// Raw bytes of the server-push stream
pub type ByteStream = BoxStream<'static, Result<Bytes, McpError>>;

/// HTTP exchange primitives, swappable for tests
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message; waits for the response when `message` is a request
    async fn post(
        &self,
        message: &JsonRpcMessage,
        headers: &SessionHeaders,
    ) -> Result<PostReply, McpError>;

    /// Open the server-push stream, resuming after `last_event_id` if given
    async fn open_stream(
        &self,
        headers: &SessionHeaders,
        last_event_id: Option<&str>,
    ) -> Result<ByteStream, McpError>;

    /// End the session on the server
    async fn terminate(&self, headers: &SessionHeaders) -> Result<(), McpError>;
}
