//! In-process server double for session and client tests

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::ClientConfig;
use crate::error::McpError;
use crate::protocol::{
    methods, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RpcErrorCode, RpcErrorObject,
};
use crate::retry::RetryConfig;
use crate::session::SessionState;
use crate::transport::{ByteStream, PostReply, SessionHeaders, Transport};

pub(crate) const MOCK_URL: &str = "http://mock.test/mcp";
pub(crate) const MOCK_SESSION: &str = "sess-1";

/// How the server answers one request
pub(crate) enum Answer {
    Result(Value),
    Error(RpcErrorCode, &'static str),
    /// 202; the response, if any, comes over the stream
    Accepted,
    Fail(McpError),
}

type Handler = Box<dyn Fn(&JsonRpcRequest) -> Answer + Send + Sync>;

pub(crate) struct MockServer {
    capabilities: Value,
    handler: Handler,
    initialize: Mutex<Option<Handler>>,
    pub(crate) posted: Mutex<Vec<(JsonRpcMessage, SessionHeaders)>>,
    streams: Mutex<VecDeque<mpsc::UnboundedReceiver<Bytes>>>,
    pub(crate) stream_opens: AtomicUsize,
    pub(crate) terminated: AtomicBool,
}

impl MockServer {
    /// `initialize` is answered with `capabilities`; everything else goes to `handler`
    pub(crate) fn new(
        capabilities: Value,
        handler: impl Fn(&JsonRpcRequest) -> Answer + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            handler: Box::new(handler),
            initialize: Mutex::new(None),
            posted: Mutex::new(Vec::new()),
            streams: Mutex::new(VecDeque::new()),
            stream_opens: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
        })
    }

    /// Answer `initialize` with `handler` instead of succeeding
    pub(crate) fn on_initialize(
        &self,
        handler: impl Fn(&JsonRpcRequest) -> Answer + Send + Sync + 'static,
    ) {
        *self.initialize.lock() = Some(Box::new(handler));
    }

    /// Queue a stream for the next `open_stream`; drop the sender to end it
    pub(crate) fn add_stream(&self) -> mpsc::UnboundedSender<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().push_back(rx);
        tx
    }

    pub(crate) fn count(&self, method: &str) -> usize {
        self.posted
            .lock()
            .iter()
            .filter(|(message, _)| message.method() == Some(method))
            .count()
    }

    pub(crate) fn opens(&self) -> usize {
        self.stream_opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockServer {
    async fn post(
        &self,
        message: &JsonRpcMessage,
        headers: &SessionHeaders,
    ) -> Result<PostReply, McpError> {
        self.posted.lock().push((message.clone(), headers.clone()));
        let JsonRpcMessage::Request(request) = message else {
            return Ok(PostReply::accepted(None));
        };

        let answer = if request.method == methods::INITIALIZE {
            match self.initialize.lock().as_ref() {
                Some(handler) => handler(request),
                None => Answer::Result(json!({
                    "protocolVersion": "2025-11-25",
                    "capabilities": self.capabilities,
                    "serverInfo": {"name": "mock", "version": "0.1.0"}
                })),
            }
        } else {
            (self.handler)(request)
        };

        let id = request.id.clone();
        match answer {
            Answer::Result(result) => Ok(PostReply {
                response: Some(JsonRpcResponse::success(id, result)),
                notifications: Vec::new(),
                session_id: Some(MOCK_SESSION.to_string()),
            }),
            Answer::Error(code, message) => Ok(PostReply {
                response: Some(JsonRpcResponse::failure(
                    Some(id),
                    RpcErrorObject {
                        code,
                        message: message.to_string(),
                        data: None,
                    },
                )),
                notifications: Vec::new(),
                session_id: Some(MOCK_SESSION.to_string()),
            }),
            Answer::Accepted => Ok(PostReply::accepted(Some(MOCK_SESSION.to_string()))),
            Answer::Fail(e) => Err(e),
        }
    }

    async fn open_stream(
        &self,
        _headers: &SessionHeaders,
        _last_event_id: Option<&str>,
    ) -> Result<ByteStream, McpError> {
        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        match self.streams.lock().pop_front() {
            Some(rx) => Ok(UnboundedReceiverStream::new(rx).map(Ok).boxed()),
            None => Err(McpError::http_status(405, "")),
        }
    }

    async fn terminate(&self, _headers: &SessionHeaders) -> Result<(), McpError> {
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One SSE `message` frame carrying `value`
pub(crate) fn frame(value: &Value) -> Bytes {
    Bytes::from(format!("event: message\ndata: {}\n\n", value))
}

pub(crate) fn fast_config() -> ClientConfig {
    ClientConfig::parse(MOCK_URL)
        .unwrap()
        .with_request_timeout(Duration::from_secs(5))
        .with_handshake_retry(
            RetryConfig::handshake_default()
                .with_max_attempts(Some(2))
                .with_delays(Duration::from_millis(1), Duration::from_millis(5)),
        )
        .with_reconnect(
            RetryConfig::reconnect_default()
                .with_delays(Duration::from_millis(100), Duration::from_millis(200)),
        )
        .with_poll_interval(Duration::from_millis(10))
        .with_event_grace(Duration::from_millis(100))
}

pub(crate) async fn wait_for(rx: &mut watch::Receiver<SessionState>, state: SessionState) {
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("session never reached {}", state))
        .unwrap();
}

pub(crate) async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

pub(crate) fn tool_capabilities() -> Value {
    json!({
        "tools": {"listChanged": true},
        "resources": {"subscribe": true}
    })
}
