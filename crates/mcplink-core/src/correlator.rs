//! Request correlation
//!
//! Matches responses to the requests that caused them. A response may come
//! back in the POST reply or, after `202 Accepted`, over the notification
//! stream; both paths end in [`RequestCorrelator::deliver`].

use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::McpError;
use crate::notify::NotificationHub;
use crate::protocol::{
    methods, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    ResponseOutcome, TaskReport,
};
use crate::transport::{SessionHeaders, Transport};

type Slot = oneshot::Sender<Result<JsonRpcResponse, McpError>>;

struct PendingRequest {
    method: String,
    sent_at: Instant,
    slot: Slot,
}

/// Removes the pending entry however the call ends
struct PendingGuard<'a> {
    pending: &'a DashMap<RequestId, PendingRequest>,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Result value plus the session id header from the reply
#[derive(Debug, Clone)]
pub struct CallReply {
    pub result: Value,
    pub session_id: Option<String>,
}

/// What a successful call produced
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Ready(Value),
    /// The server turned the request into a task
    Task(TaskReport),
}

/// Recognize task-shaped results
pub fn classify_result(value: Value) -> Result<CallOutcome, McpError> {
    if TaskReport::looks_like_task(&value) {
        Ok(CallOutcome::Task(TaskReport::from_value(&value)?))
    } else {
        Ok(CallOutcome::Ready(value))
    }
}

pub struct RequestCorrelator {
    transport: Arc<dyn Transport>,
    hub: Arc<NotificationHub>,
    next_id: AtomicI64,
    pending: DashMap<RequestId, PendingRequest>,
    request_timeout: Duration,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl RequestCorrelator {
    pub fn new(
        transport: Arc<dyn Transport>,
        hub: Arc<NotificationHub>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            hub,
            next_id: AtomicI64::new(1),
            pending: DashMap::new(),
            request_timeout,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Send a request and wait for its result
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        headers: &SessionHeaders,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        self.call_with_reply(method, params, headers, cancel)
            .await
            .map(|reply| reply.result)
    }

    /// Like [`call`](Self::call), also returning the reply's session id header
    pub async fn call_with_reply(
        &self,
        method: &str,
        params: Option<Value>,
        headers: &SessionHeaders,
        cancel: &CancellationToken,
    ) -> Result<CallReply, McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::SessionClosed);
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                sent_at: Instant::now(),
                slot: tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        debug!(method, id = %id, "Sending request");
        let request = JsonRpcMessage::Request(JsonRpcRequest::new(id.clone(), method, params));
        let deadline = tokio::time::Instant::now() + self.request_timeout;

        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(McpError::SessionClosed),
            _ = cancel.cancelled() => {
                self.send_cancelled(&id, headers);
                Err(McpError::Cancelled {
                    method: method.to_string(),
                    id: Some(id.clone()),
                })
            }
            result = tokio::time::timeout_at(deadline, self.exchange(&request, headers, rx)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(method, id = %id, "Request timed out after {:?}", self.request_timeout);
                        Err(McpError::TransportTimeout {
                            method: method.to_string(),
                            id: Some(id.clone()),
                            timeout: self.request_timeout,
                        })
                    }
                }
            }
        };

        let (response, session_id) = outcome.map_err(|e| e.for_request(method, &id))?;
        match response.outcome {
            ResponseOutcome::Result(result) => Ok(CallReply { result, session_id }),
            ResponseOutcome::Error(error) => {
                debug!(method, id = %id, code = error.code.code(), "Server returned error");
                Err(McpError::Rpc {
                    method: method.to_string(),
                    id,
                    code: error.code,
                    message: error.message,
                    data: error.data,
                })
            }
        }
    }

    async fn exchange(
        &self,
        request: &JsonRpcMessage,
        headers: &SessionHeaders,
        rx: oneshot::Receiver<Result<JsonRpcResponse, McpError>>,
    ) -> Result<(JsonRpcResponse, Option<String>), McpError> {
        let JsonRpcMessage::Request(JsonRpcRequest { id, .. }) = request else {
            return Err(McpError::protocol("only requests can be correlated"));
        };

        let reply = self.transport.post(request, headers).await?;
        for notification in reply.notifications {
            self.hub.publish(notification);
        }
        if let Some(mut response) = reply.response {
            // Servers answer unparseable requests with a null id
            if response.id.is_none() {
                response.id = Some(id.clone());
            }
            self.deliver(response);
        }

        // Either already delivered above or coming over the stream
        match rx.await {
            Ok(result) => result.map(|response| (response, reply.session_id)),
            Err(_) => Err(McpError::SessionClosed),
        }
    }

    /// Hand a response to its waiting caller; false when nobody is waiting
    pub fn deliver(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id.clone() else {
            warn!("Dropping response without an id");
            return false;
        };
        match self.pending.remove(&id) {
            Some((_, pending)) => {
                debug!(
                    method = %pending.method,
                    id = %id,
                    "Response delivered after {:?}",
                    pending.sent_at.elapsed()
                );
                pending.slot.send(Ok(response)).is_ok()
            }
            None => {
                debug!(id = %id, "No pending request for response (late or unknown id)");
                false
            }
        }
    }

    /// Send a notification
    pub async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        headers: &SessionHeaders,
    ) -> Result<(), McpError> {
        let message = JsonRpcMessage::Notification(JsonRpcNotification::new(method, params));
        self.transport.post(&message, headers).await.map(|_| ())
    }

    fn send_cancelled(&self, id: &RequestId, headers: &SessionHeaders) {
        let transport = self.transport.clone();
        let headers = headers.clone();
        let message = JsonRpcMessage::Notification(JsonRpcNotification::new(
            methods::CANCELLED,
            Some(json!({"requestId": id, "reason": "cancelled by client"})),
        ));
        let id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.post(&message, &headers).await {
                debug!(id = %id, "Cancellation notice not delivered: {}", e);
            }
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fail every waiting caller with `SessionClosed` and refuse new calls
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let count = ids.len();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.slot.send(Err(McpError::SessionClosed));
            }
        }
        if count > 0 {
            debug!("Failed {} pending request(s) on close", count);
        }
    }
}
