//! MCP client facade
//!
//! [`McpClient`] is the session value callers hold: it connects, sends
//! gated requests, turns task-shaped results into awaited outcomes, and
//! tears everything down on [`disconnect`](McpClient::disconnect).

mod requests;
mod subscription;

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ClientConfig;
use crate::correlator::{classify_result, CallOutcome};
use crate::error::McpError;
use crate::notify::NotificationStream;
use crate::protocol::methods;
use crate::session::{RpcCaller, Session, SessionManager, SessionState};
use crate::store::SessionRecord;
use crate::tasks::{AwaitMode, TaskHandle, TaskOrchestrator, TaskOutcome};
use crate::transport::{HttpTransport, Transport};

pub use subscription::ResourceSubscription;

/// Result of [`McpClient::call_async`]
#[derive(Debug, Clone)]
pub enum AsyncCall {
    /// The server answered directly
    Ready(Value),
    /// The server started a task; await or cancel it through the handle
    Task(TaskHandle),
}

pub struct McpClient {
    manager: Arc<SessionManager>,
    tasks: Arc<TaskOrchestrator>,
    server_url: String,
}

impl McpClient {
    /// Connect over HTTP
    pub async fn connect(config: ClientConfig) -> Result<Self, McpError> {
        let transport = Arc::new(HttpTransport::new(
            config.endpoint.clone(),
            config.request_timeout,
        )?);
        Self::connect_with(transport, config).await
    }

    /// Connect over a caller-supplied transport
    pub async fn connect_with(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
    ) -> Result<Self, McpError> {
        let manager = SessionManager::establish(config, transport).await?;
        Ok(Self::from_manager(manager))
    }

    /// Reuse a saved session if the server still accepts it, else handshake
    pub async fn resume(config: ClientConfig, record: &SessionRecord) -> Result<Self, McpError> {
        let transport = Arc::new(HttpTransport::new(
            config.endpoint.clone(),
            config.request_timeout,
        )?);
        Self::resume_with(transport, config, record).await
    }

    pub async fn resume_with(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        record: &SessionRecord,
    ) -> Result<Self, McpError> {
        let manager = SessionManager::resume(config, transport, record).await?;
        Ok(Self::from_manager(manager))
    }

    fn from_manager(manager: SessionManager) -> Self {
        let manager = Arc::new(manager);
        let config = manager.config();
        let server_url = config.endpoint.to_string();
        let tasks = Arc::new(TaskOrchestrator::new(
            manager.clone() as Arc<dyn RpcCaller>,
            manager.hub(),
            config.poll_interval,
            config.event_grace,
            config.task_ttl,
        ));
        Self {
            manager,
            tasks,
            server_url,
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn session(&self) -> Arc<Session> {
        self.manager.session()
    }

    pub fn state(&self) -> SessionState {
        self.manager.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.manager.watch_state()
    }

    /// Flips to true when the event stream will not be reopened
    pub fn watch_stream_exhausted(&self) -> watch::Receiver<bool> {
        self.manager.watch_stream_exhausted()
    }

    /// Every server notification from now on
    pub fn notifications(&self) -> NotificationStream {
        self.manager.notifications()
    }

    /// Snapshot for [`SessionStore`](crate::store::SessionStore)
    pub fn record(&self) -> SessionRecord {
        SessionRecord::from_session(&self.server_url, &self.manager.session())
    }

    pub fn pending_requests(&self) -> usize {
        self.manager.pending_requests()
    }

    pub fn tracked_tasks(&self) -> usize {
        self.tasks.tracked_count()
    }

    /// Send a request and wait for its result
    ///
    /// A result shaped as a task is awaited by polling. A task that stops
    /// for input fails the call with [`McpError::InputRequired`]; use
    /// [`call_async`](Self::call_async) to handle input.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.call_cancellable(method, params, &CancellationToken::new())
            .await
    }

    pub async fn call_cancellable(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        let value = self.manager.request(method, params, cancel).await?;
        // tasks/* answers describe a task; they do not start one
        if method.starts_with("tasks/") {
            return Ok(value);
        }
        let report = match classify_result(value)? {
            CallOutcome::Ready(value) => return Ok(value),
            CallOutcome::Task(report) => report,
        };

        let handle = self.tasks.track(method, report);
        let outcome = tokio::select! {
            outcome = self.tasks.await_task(&handle, AwaitMode::Polling) => outcome?,
            _ = cancel.cancelled() => {
                self.tasks.cancel(&handle);
                return Err(McpError::Cancelled {
                    method: method.to_string(),
                    id: None,
                });
            }
        };
        match outcome {
            TaskOutcome::Completed(value) => Ok(value),
            TaskOutcome::InputRequired(task) => {
                self.tasks.release(&handle);
                Err(McpError::InputRequired {
                    task_id: task.task_id,
                    message: task
                        .status_message
                        .unwrap_or_else(|| "server requested input".to_string()),
                })
            }
        }
    }

    /// Send a request the server should run as a task
    ///
    /// Both capability checks run locally before anything is sent.
    pub async fn call_async(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<AsyncCall, McpError> {
        self.manager.check(method)?;
        self.manager
            .session()
            .capabilities
            .check_task_augmentation(method)?;

        let params = with_task_request(params, self.manager.config().task_ttl)?;
        let value = self
            .manager
            .request(method, Some(params), &CancellationToken::new())
            .await?;
        match classify_result(value)? {
            CallOutcome::Ready(value) => {
                debug!(method, "Server answered a task request directly");
                Ok(AsyncCall::Ready(value))
            }
            CallOutcome::Task(report) => Ok(AsyncCall::Task(self.tasks.track(method, report))),
        }
    }

    pub async fn await_task(
        &self,
        handle: &TaskHandle,
        mode: AwaitMode,
    ) -> Result<TaskOutcome, McpError> {
        self.tasks.await_task(handle, mode).await
    }

    /// Release locally and ask the server to stop; does not wait for it
    pub fn cancel_task(&self, handle: &TaskHandle) {
        self.tasks.cancel(handle);
    }

    /// Subscribe to `notifications/resources/updated` for one resource
    pub async fn subscribe_resource(&self, uri: &str) -> Result<ResourceSubscription, McpError> {
        self.manager.check(methods::RESOURCES_SUBSCRIBE)?;
        // Listen before subscribing so the first update cannot slip past
        let updates = self.manager.hub().subscribe_method(methods::RESOURCES_UPDATED);
        self.manager
            .request(
                methods::RESOURCES_SUBSCRIBE,
                Some(json!({"uri": uri})),
                &CancellationToken::new(),
            )
            .await?;
        Ok(ResourceSubscription::new(
            uri.to_string(),
            updates,
            self.manager.clone(),
        ))
    }

    /// End the session; pending calls fail with `SessionClosed`
    pub async fn disconnect(&self) {
        self.tasks.clear();
        self.manager.disconnect().await;
    }
}

/// Add the `task` member that asks the server to run a request as a task
fn with_task_request(params: Option<Value>, ttl: Option<Duration>) -> Result<Value, McpError> {
    let mut object = match params {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(object)) => object,
        Some(other) => {
            return Err(McpError::protocol_with_raw(
                "task-augmented params must be an object",
                &other,
            ))
        }
    };
    let task = match ttl {
        Some(ttl) => json!({"ttl": u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)}),
        None => json!({}),
    };
    object.insert("task".to_string(), task);
    Ok(Value::Object(object))
}
