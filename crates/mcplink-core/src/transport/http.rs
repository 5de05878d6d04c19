//! Streamable HTTP transport backed by reqwest

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::sse::{decode_frames, SseDecoder, SseFrame};
use super::{
    ByteStream, PostReply, SessionHeaders, Transport, ACCEPT_POST, ACCEPT_STREAM,
    LAST_EVENT_ID_HEADER, PROTOCOL_VERSION_HEADER, SESSION_HEADER,
};
use crate::error::McpError;
use crate::protocol::{JsonRpcMessage, JsonRpcNotification, JsonRpcResponse};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(endpoint: Url, request_timeout: Duration) -> Result<Self, McpError> {
        // No client-wide timeout: the push stream is long-lived
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| McpError::transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint,
            request_timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn with_session(&self, builder: RequestBuilder, headers: &SessionHeaders) -> RequestBuilder {
        let mut builder = builder;
        if let Some(session_id) = &headers.session_id {
            builder = builder.header(SESSION_HEADER, session_id);
        }
        if let Some(version) = &headers.protocol_version {
            builder = builder.header(PROTOCOL_VERSION_HEADER, version);
        }
        builder
    }

    fn map_send_error(&self, e: reqwest::Error, method: Option<&str>) -> McpError {
        if e.is_timeout() {
            McpError::TransportTimeout {
                method: method.unwrap_or("<response>").to_string(),
                id: None,
                timeout: self.request_timeout,
            }
        } else {
            McpError::transport(format!("request failed: {}", e))
        }
    }

    async fn read_event_stream(
        &self,
        response: Response,
        status: u16,
        session_id: Option<String>,
        method: Option<&str>,
    ) -> Result<PostReply, McpError> {
        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut notifications = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.map_send_error(e, method))?;
            for frame in decoder.feed(&chunk) {
                if let Some(response) = absorb_frame(&frame, &mut notifications)? {
                    return Ok(PostReply {
                        response: Some(response),
                        notifications,
                        session_id,
                    });
                }
            }
        }
        if let Some(frame) = decoder.finish() {
            if let Some(response) = absorb_frame(&frame, &mut notifications)? {
                return Ok(PostReply {
                    response: Some(response),
                    notifications,
                    session_id,
                });
            }
        }

        Err(McpError::unexpected_body(
            status,
            "event stream ended before the response arrived",
            "",
        ))
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
}

/// Route one SSE frame from a POST reply; returns the response if this frame carried it
fn absorb_frame(
    frame: &SseFrame,
    notifications: &mut Vec<JsonRpcNotification>,
) -> Result<Option<JsonRpcResponse>, McpError> {
    if !frame.is_message() || frame.data.trim().is_empty() {
        return Ok(None);
    }
    match JsonRpcMessage::parse(&frame.data)? {
        JsonRpcMessage::Response(response) => Ok(Some(response)),
        JsonRpcMessage::Notification(notification) => {
            notifications.push(notification);
            Ok(None)
        }
        JsonRpcMessage::Request(request) => {
            warn!(
                "Ignoring server request '{}' (id {}): not supported by this client",
                request.method, request.id
            );
            Ok(None)
        }
    }
}

/// Decode a buffered POST body: plain JSON first, then an SSE body
pub(crate) fn decode_body(
    status: u16,
    body: &str,
) -> Result<(JsonRpcResponse, Vec<JsonRpcNotification>), McpError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(McpError::unexpected_body(status, "empty response body", body));
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return match JsonRpcMessage::from_value(value)? {
            JsonRpcMessage::Response(response) => Ok((response, Vec::new())),
            other => Err(McpError::protocol(format!(
                "expected a response, got a {}",
                other.kind()
            ))),
        };
    }

    let frames = decode_frames(body);
    if frames.is_empty() {
        return Err(McpError::unexpected_body(
            status,
            "response body is neither JSON nor an event stream",
            body,
        ));
    }
    let mut notifications = Vec::new();
    for frame in &frames {
        if let Some(response) = absorb_frame(frame, &mut notifications)? {
            return Ok((response, notifications));
        }
    }
    Err(McpError::unexpected_body(
        status,
        "event stream carried no response",
        body,
    ))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        message: &JsonRpcMessage,
        headers: &SessionHeaders,
    ) -> Result<PostReply, McpError> {
        let is_request = matches!(message, JsonRpcMessage::Request(_));
        let method = message.method();

        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header(ACCEPT, ACCEPT_POST)
            .header(CONTENT_TYPE, "application/json")
            .json(message);
        builder = self.with_session(builder, headers);
        if is_request {
            builder = builder.timeout(self.request_timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.map_send_error(e, method))?;
        let status = response.status();
        let session_id = header_str(response.headers(), SESSION_HEADER);
        debug!(
            method = method.unwrap_or("<response>"),
            status = status.as_u16(),
            "POST completed"
        );

        if status == StatusCode::ACCEPTED {
            return Ok(PostReply::accepted(session_id));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::http_status(status.as_u16(), &body));
        }
        if !is_request {
            // Some servers answer notifications with 200 and a body; nothing to read
            return Ok(PostReply::accepted(session_id));
        }

        let content_type = header_str(response.headers(), CONTENT_TYPE.as_str()).unwrap_or_default();
        if content_type.starts_with(ACCEPT_STREAM) {
            return self
                .read_event_stream(response, status.as_u16(), session_id, method)
                .await;
        }

        let body = response
            .text()
            .await
            .map_err(|e| self.map_send_error(e, method))?;
        let (response, notifications) = decode_body(status.as_u16(), &body)?;
        Ok(PostReply {
            response: Some(response),
            notifications,
            session_id,
        })
    }

    async fn open_stream(
        &self,
        headers: &SessionHeaders,
        last_event_id: Option<&str>,
    ) -> Result<ByteStream, McpError> {
        let mut builder = self
            .client
            .get(self.endpoint.clone())
            .header(ACCEPT, ACCEPT_STREAM);
        builder = self.with_session(builder, headers);
        if let Some(id) = last_event_id {
            builder = builder.header(LAST_EVENT_ID_HEADER, id);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| McpError::transport(format!("failed to open event stream: {}", e)))?;
        let status = response.status();
        if status == StatusCode::METHOD_NOT_ALLOWED {
            return Err(McpError::Transport {
                method: None,
                status: Some(status.as_u16()),
                message: "server does not offer an event stream".to_string(),
                body: None,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::http_status(status.as_u16(), &body));
        }
        let content_type = header_str(response.headers(), CONTENT_TYPE.as_str()).unwrap_or_default();
        if !content_type.starts_with(ACCEPT_STREAM) {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::unexpected_body(
                status.as_u16(),
                format!("expected an event stream, got '{}'", content_type),
                &body,
            ));
        }

        debug!("Event stream opened (resume from {:?})", last_event_id);
        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| McpError::transport(format!("event stream read failed: {}", e)))
            })
            .boxed())
    }

    async fn terminate(&self, headers: &SessionHeaders) -> Result<(), McpError> {
        if headers.session_id.is_none() {
            return Ok(());
        }
        let builder = self.with_session(self.client.delete(self.endpoint.clone()), headers);
        let response = builder
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| McpError::transport(format!("session termination failed: {}", e)))?;
        let status = response.status();
        // 405: the server does not let clients end sessions
        if status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(McpError::http_status(status.as_u16(), &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestId, ResponseOutcome};
    use std::io::Read;

    #[test]
    fn test_decode_plain_json() {
        let (response, notifications) =
            decode_body(200, r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#).unwrap();
        assert_eq!(response.id, Some(RequestId::Number(1)));
        assert!(notifications.is_empty());
    }

    #[test]
    fn test_decode_sse_body_with_leading_notification() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{\"progress\":1}}\n\n\
                    event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{}}\n\n";
        let (response, notifications) = decode_body(200, body).unwrap();
        assert_eq!(response.id, Some(RequestId::Number(2)));
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].method, "notifications/progress");
    }

    #[test]
    fn test_decode_non_json_body_is_transport_error() {
        let err = decode_body(200, "<html>gateway</html>").unwrap_err();
        match err {
            McpError::Transport { status, body, .. } => {
                assert_eq!(status, Some(200));
                assert!(body.unwrap().contains("gateway"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_malformed_envelope_is_protocol_violation() {
        let err = decode_body(200, r#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert!(matches!(err, McpError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_decode_error_response() {
        let (response, _) = decode_body(
            200,
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        assert!(matches!(response.outcome, ResponseOutcome::Error(_)));
    }

    /// A request as the test server saw it
    #[derive(Debug)]
    struct Seen {
        method: String,
        session_id: Option<String>,
        protocol_version: Option<String>,
        last_event_id: Option<String>,
        body: String,
    }

    type Reply = (u16, &'static str, String);

    /// Serve one canned reply per incoming request on a local port
    fn serve(replies: Vec<Reply>) -> (Url, std::sync::mpsc::Receiver<Seen>) {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();

        std::thread::spawn(move || {
            for (status, content_type, body) in replies {
                let Ok(mut request) = server.recv() else {
                    return;
                };
                let header = |name: &'static str| {
                    request
                        .headers()
                        .iter()
                        .find(|h| h.field.equiv(name))
                        .map(|h| h.value.as_str().to_string())
                };
                let mut seen = Seen {
                    method: request.method().to_string(),
                    session_id: header(SESSION_HEADER),
                    protocol_version: header(PROTOCOL_VERSION_HEADER),
                    last_event_id: header(LAST_EVENT_ID_HEADER),
                    body: String::new(),
                };
                let _ = request.as_reader().read_to_string(&mut seen.body);
                let _ = tx.send(seen);

                let mut response =
                    tiny_http::Response::from_string(body).with_status_code(status);
                response.add_header(
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], content_type.as_bytes())
                        .unwrap(),
                );
                response.add_header(
                    tiny_http::Header::from_bytes(&b"Mcp-Session-Id"[..], &b"sess-42"[..]).unwrap(),
                );
                let _ = request.respond(response);
            }
        });

        let url = Url::parse(&format!("http://{}/mcp", addr)).unwrap();
        (url, rx)
    }

    fn transport(url: Url) -> HttpTransport {
        HttpTransport::new(url, Duration::from_secs(5)).unwrap()
    }

    fn request(id: i64, method: &str) -> JsonRpcMessage {
        JsonRpcMessage::Request(crate::protocol::JsonRpcRequest::new(
            RequestId::Number(id),
            method,
            None,
        ))
    }

    #[tokio::test]
    async fn test_post_sends_session_headers_and_reads_session_id() {
        let (url, seen) = serve(vec![(
            200,
            "application/json",
            r#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_string(),
        )]);
        let headers = SessionHeaders {
            session_id: Some("sess-41".to_string()),
            protocol_version: Some("2025-11-25".to_string()),
        };
        let reply = transport(url).post(&request(1, "ping"), &headers).await.unwrap();
        assert_eq!(reply.session_id.as_deref(), Some("sess-42"));
        assert_eq!(reply.response.unwrap().id, Some(RequestId::Number(1)));

        let seen = seen.recv().unwrap();
        assert_eq!(seen.method, "POST");
        assert_eq!(seen.session_id.as_deref(), Some("sess-41"));
        assert_eq!(seen.protocol_version.as_deref(), Some("2025-11-25"));
        assert!(seen.body.contains("\"method\":\"ping\""));
    }

    #[tokio::test]
    async fn test_post_accepted_has_no_response() {
        let (url, _seen) = serve(vec![(202, "text/plain", String::new())]);
        let reply = transport(url)
            .post(&request(5, "tools/list"), &SessionHeaders::default())
            .await
            .unwrap();
        assert!(reply.response.is_none());
    }

    #[tokio::test]
    async fn test_post_reads_event_stream_reply() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{}}\n\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"tools\":[]}}\n\n";
        let (url, _seen) = serve(vec![(200, "text/event-stream", body.to_string())]);
        let reply = transport(url)
            .post(&request(2, "tools/list"), &SessionHeaders::default())
            .await
            .unwrap();
        assert_eq!(reply.notifications.len(), 1);
        assert_eq!(reply.response.unwrap().id, Some(RequestId::Number(2)));
    }

    #[tokio::test]
    async fn test_post_http_error_keeps_status() {
        let (url, _seen) = serve(vec![(404, "text/plain", "no such session".to_string())]);
        let err = transport(url)
            .post(&request(3, "ping"), &SessionHeaders::default())
            .await
            .unwrap_err();
        match err {
            McpError::Transport { status, .. } => assert_eq!(status, Some(404)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_refused_is_not_retryable() {
        use crate::retry::IsRetryable;
        let (url, seen) = serve(vec![(405, "text/plain", String::new())]);
        let result = transport(url)
            .open_stream(&SessionHeaders::default(), Some("evt-7"))
            .await;
        let Err(err) = result else {
            panic!("stream should be refused");
        };
        assert!(!err.is_retryable());
        let seen = seen.recv().unwrap();
        assert_eq!(seen.method, "GET");
        assert_eq!(seen.last_event_id.as_deref(), Some("evt-7"));
    }

    #[tokio::test]
    async fn test_terminate_sends_delete() {
        let (url, seen) = serve(vec![(200, "text/plain", String::new())]);
        let headers = SessionHeaders {
            session_id: Some("sess-42".to_string()),
            protocol_version: None,
        };
        transport(url).terminate(&headers).await.unwrap();
        let seen = seen.recv().unwrap();
        assert_eq!(seen.method, "DELETE");
        assert_eq!(seen.session_id.as_deref(), Some("sess-42"));
    }
}
