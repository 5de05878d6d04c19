//! Task orchestration
//!
//! Drives server-side tasks to a terminal state, either by polling
//! `tasks/get` or by waiting on `notifications/tasks/status` with a polling
//! fallback. A task that makes no progress within its TTL is abandoned
//! locally.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::McpError;
use crate::notify::{NotificationHub, NotificationStream};
use crate::protocol::{methods, Task, TaskReport, TaskStatus};
use crate::session::RpcCaller;

/// How `await_task` learns about status changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitMode {
    Polling,
    /// Status notifications, polling once whenever the grace window passes quietly
    Events,
}

/// Caller's reference to a tracked task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task_id: String,
    method: String,
    cancel: CancellationToken,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The request that created the task
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// How an await ended, short of an error
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Value),
    /// The server needs input before the task can continue. Supply it and
    /// call `await_task` again with the same handle.
    InputRequired(Task),
}

struct TrackedTask {
    task: Task,
    result: Option<Value>,
    ttl: Option<Duration>,
    /// Local time the task last showed progress
    last_progress: Instant,
    /// An InputRequired outcome was handed out and no newer status has arrived
    awaiting_input: bool,
}

impl TrackedTask {
    fn new(report: TaskReport, fallback_ttl: Option<Duration>) -> Self {
        Self {
            ttl: report.task.ttl().or(fallback_ttl),
            task: report.task,
            result: report.result,
            last_progress: Instant::now(),
            awaiting_input: false,
        }
    }

    fn update(&mut self, report: TaskReport) {
        let advanced = report.task.status != self.task.status
            || report.task.status_message != self.task.status_message
            || match (report.task.last_updated_at, self.task.last_updated_at) {
                (Some(new), Some(old)) => new > old,
                (Some(_), None) => true,
                _ => false,
            };
        if advanced {
            self.last_progress = Instant::now();
        }
        self.awaiting_input = false;
        if let Some(ttl) = report.task.ttl() {
            self.ttl = Some(ttl);
        }
        if report.result.is_some() {
            self.result = report.result;
        }
        self.task = report.task;
    }

    /// Time left before the TTL fires; None means unlimited
    fn remaining(&self) -> Option<Duration> {
        self.ttl
            .map(|ttl| ttl.saturating_sub(self.last_progress.elapsed()))
    }
}

pub struct TaskOrchestrator {
    rpc: Arc<dyn RpcCaller>,
    hub: Arc<NotificationHub>,
    tasks: Mutex<HashMap<String, TrackedTask>>,
    default_poll_interval: Duration,
    event_grace: Duration,
    /// Applied when the server reports no TTL
    fallback_ttl: Option<Duration>,
    root: CancellationToken,
}

impl TaskOrchestrator {
    pub fn new(
        rpc: Arc<dyn RpcCaller>,
        hub: Arc<NotificationHub>,
        default_poll_interval: Duration,
        event_grace: Duration,
        fallback_ttl: Option<Duration>,
    ) -> Self {
        Self {
            rpc,
            hub,
            tasks: Mutex::new(HashMap::new()),
            default_poll_interval,
            event_grace,
            fallback_ttl,
            root: CancellationToken::new(),
        }
    }

    /// Start tracking a task the server created for `method`
    pub fn track(&self, method: &str, report: TaskReport) -> TaskHandle {
        let task_id = report.task.task_id.clone();
        debug!(task_id = %task_id, method, status = %report.task.status, "Tracking task");
        self.tasks
            .lock()
            .insert(task_id.clone(), TrackedTask::new(report, self.fallback_ttl));
        TaskHandle {
            task_id,
            method: method.to_string(),
            cancel: self.root.child_token(),
        }
    }

    /// Latest known status of a tracked task
    pub fn tracked(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().get(task_id).map(|t| t.task.clone())
    }

    pub fn tracked_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Wait until the task completes, fails, expires or needs input
    pub async fn await_task(
        &self,
        handle: &TaskHandle,
        mode: AwaitMode,
    ) -> Result<TaskOutcome, McpError> {
        // Subscribe first so a status change racing the first check is not lost
        let mut statuses = match mode {
            AwaitMode::Events => Some(self.hub.subscribe_method(methods::TASKS_STATUS)),
            AwaitMode::Polling => None,
        };

        // Resuming after input: the stored status is stale, ask again first
        let mut refresh = self
            .tasks
            .lock()
            .get(&handle.task_id)
            .is_some_and(|t| t.awaiting_input);

        loop {
            if refresh {
                refresh = false;
                self.poll_once(handle).await?;
            }
            if let Some(outcome) = self.settle(handle).await? {
                return Ok(outcome);
            }
            let (interval, remaining) = self.timing(handle)?;

            let wait = match mode {
                AwaitMode::Polling => interval,
                AwaitMode::Events => self.event_grace,
            };
            let wait = remaining.map_or(wait, |r| wait.min(r));

            let woke_by_event = match statuses.as_mut() {
                Some(stream) => self.wait_for_status(handle, stream, wait).await?,
                None => {
                    tokio::select! {
                        _ = handle.cancel.cancelled() => return Err(self.cancelled(handle)),
                        _ = tokio::time::sleep(wait) => false,
                    }
                }
            };
            if woke_by_event || self.expired(handle) {
                continue;
            }
            self.poll_once(handle).await?;
        }
    }

    /// Resolve the current status into an outcome if it is final or needs input
    async fn settle(&self, handle: &TaskHandle) -> Result<Option<TaskOutcome>, McpError> {
        if handle.cancel.is_cancelled() {
            return Err(self.cancelled(handle));
        }
        let (task, result) = {
            let tasks = self.tasks.lock();
            let tracked = tasks.get(&handle.task_id).ok_or_else(|| McpError::TaskFailed {
                task_id: handle.task_id.clone(),
                message: "task is no longer tracked".to_string(),
            })?;
            (tracked.task.clone(), tracked.result.clone())
        };

        match task.status {
            TaskStatus::Working => Ok(None),
            TaskStatus::InputRequired => {
                if let Some(tracked) = self.tasks.lock().get_mut(&handle.task_id) {
                    tracked.awaiting_input = true;
                }
                info!(task_id = %task.task_id, "Task is waiting for input");
                Ok(Some(TaskOutcome::InputRequired(task)))
            }
            TaskStatus::Completed => {
                let result = match result {
                    Some(result) => result,
                    None => self.fetch_result(handle).await?,
                };
                self.untrack(&handle.task_id);
                debug!(task_id = %handle.task_id, "Task completed");
                Ok(Some(TaskOutcome::Completed(result)))
            }
            TaskStatus::Failed => {
                self.untrack(&handle.task_id);
                Err(McpError::TaskFailed {
                    task_id: handle.task_id.clone(),
                    message: task
                        .status_message
                        .unwrap_or_else(|| "task failed".to_string()),
                })
            }
            TaskStatus::Cancelled => {
                self.untrack(&handle.task_id);
                Err(McpError::TaskCancelled {
                    task_id: handle.task_id.clone(),
                })
            }
        }
    }

    /// Poll interval and TTL budget; fails with `TaskExpired` once the budget is spent
    fn timing(&self, handle: &TaskHandle) -> Result<(Duration, Option<Duration>), McpError> {
        let mut tasks = self.tasks.lock();
        let Some(tracked) = tasks.get(&handle.task_id) else {
            return Err(self.cancelled(handle));
        };
        let interval = tracked
            .task
            .poll_interval()
            .unwrap_or(self.default_poll_interval);
        let remaining = tracked.remaining();
        if let (Some(ttl), Some(Duration::ZERO)) = (tracked.ttl, remaining) {
            tasks.remove(&handle.task_id);
            warn!(task_id = %handle.task_id, "Task made no progress within {:?}", ttl);
            return Err(McpError::TaskExpired {
                task_id: handle.task_id.clone(),
                ttl,
            });
        }
        Ok((interval, remaining))
    }

    fn expired(&self, handle: &TaskHandle) -> bool {
        self.tasks
            .lock()
            .get(&handle.task_id)
            .and_then(TrackedTask::remaining)
            .is_some_and(|r| r.is_zero())
    }

    /// Wait up to `wait` for a status notification about this task
    async fn wait_for_status(
        &self,
        handle: &TaskHandle,
        stream: &mut NotificationStream,
        wait: Duration,
    ) -> Result<bool, McpError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notification = tokio::select! {
                _ = handle.cancel.cancelled() => return Err(self.cancelled(handle)),
                _ = tokio::time::sleep_until(deadline) => return Ok(false),
                next = stream.recv() => match next {
                    Some(notification) => notification,
                    None => return Err(McpError::SessionClosed),
                },
            };
            if notification.param_str("taskId") != Some(handle.task_id.as_str()) {
                continue;
            }
            let Some(params) = notification.params.as_ref() else {
                continue;
            };
            match TaskReport::from_value(params) {
                Ok(report) => {
                    debug!(task_id = %handle.task_id, status = %report.task.status, "Task status notification");
                    self.update(report);
                    return Ok(true);
                }
                Err(e) => warn!("Ignoring malformed task status notification: {}", e),
            }
        }
    }

    async fn poll_once(&self, handle: &TaskHandle) -> Result<(), McpError> {
        let value = self
            .rpc
            .request(
                methods::TASKS_GET,
                Some(json!({"taskId": handle.task_id})),
                &handle.cancel,
            )
            .await
            .map_err(|e| self.local_cancel(handle, e))?;
        let report = TaskReport::from_value(&value)?;
        if report.task.task_id != handle.task_id {
            return Err(McpError::protocol_with_raw(
                format!("tasks/get for {} answered for another task", handle.task_id),
                &value,
            ));
        }
        self.update(report);
        Ok(())
    }

    async fn fetch_result(&self, handle: &TaskHandle) -> Result<Value, McpError> {
        self.rpc
            .request(
                methods::TASKS_RESULT,
                Some(json!({"taskId": handle.task_id})),
                &handle.cancel,
            )
            .await
            .map_err(|e| self.local_cancel(handle, e))
    }

    fn update(&self, report: TaskReport) {
        if let Some(tracked) = self.tasks.lock().get_mut(&report.task.task_id) {
            tracked.update(report);
        }
    }

    fn local_cancel(&self, handle: &TaskHandle, error: McpError) -> McpError {
        match error {
            McpError::Cancelled { .. } if handle.cancel.is_cancelled() => self.cancelled(handle),
            other => other,
        }
    }

    fn cancelled(&self, handle: &TaskHandle) -> McpError {
        McpError::TaskCancelled {
            task_id: handle.task_id.clone(),
        }
    }

    fn untrack(&self, task_id: &str) {
        self.tasks.lock().remove(task_id);
    }

    /// Stop tracking a task without telling the server
    pub fn release(&self, handle: &TaskHandle) {
        handle.cancel.cancel();
        self.untrack(&handle.task_id);
    }

    /// Release the task locally and ask the server to cancel it
    ///
    /// Returns at once; the server's answer is not awaited.
    pub fn cancel(&self, handle: &TaskHandle) {
        self.release(handle);

        if !self.rpc.capabilities().tasks_cancel {
            debug!(task_id = %handle.task_id, "Server cannot cancel tasks; released locally");
            return;
        }
        let rpc = self.rpc.clone();
        let task_id = handle.task_id.clone();
        tokio::spawn(async move {
            let result = rpc
                .request(
                    methods::TASKS_CANCEL,
                    Some(json!({"taskId": task_id})),
                    &CancellationToken::new(),
                )
                .await;
            match result {
                Ok(_) => debug!(task_id = %task_id, "Server acknowledged cancellation"),
                Err(e) => debug!(task_id = %task_id, "Task cancellation not acknowledged: {}", e),
            }
        });
    }

    /// Drop every tracked task without contacting the server
    pub fn clear(&self) {
        self.root.cancel();
        self.tasks.lock().clear();
    }
}
