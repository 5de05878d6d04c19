//! Session lifecycle
//!
//! Runs the `initialize` handshake, holds the negotiated session, gates
//! outgoing requests, and supervises the notification channel so a lost
//! stream degrades the session instead of ending it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{SessionState, SessionStateCell};
use crate::config::ClientConfig;
use crate::correlator::{CallReply, RequestCorrelator};
use crate::error::McpError;
use crate::notify::{ChannelEvent, NotificationChannel, NotificationHub, NotificationStream};
use crate::protocol::{methods, CapabilitySet, Implementation, InitializeParams, InitializeResult};
use crate::retry::{with_retry, RetryConfig};
use crate::store::SessionRecord;
use crate::transport::{SessionHeaders, Transport};

/// The negotiated session; immutable once the handshake completes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// None for stateless servers that issue no id
    pub session_id: Option<String>,
    pub protocol_version: String,
    pub server_info: Implementation,
    pub capabilities: CapabilitySet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl Session {
    pub fn headers(&self) -> SessionHeaders {
        SessionHeaders {
            session_id: self.session_id.clone(),
            protocol_version: Some(self.protocol_version.clone()),
        }
    }
}

/// Issues gated requests; the seam the task orchestrator talks through
#[async_trait]
pub trait RpcCaller: Send + Sync {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError>;

    fn capabilities(&self) -> CapabilitySet;
}

pub struct SessionManager {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    hub: Arc<NotificationHub>,
    correlator: Arc<RequestCorrelator>,
    state: Arc<SessionStateCell>,
    session: Arc<Session>,
    /// Parent of the supervisor and every channel connection
    root: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Set once the supervisor stops reopening the stream
    stream_exhausted: Arc<watch::Sender<bool>>,
}

impl SessionManager {
    /// Handshake with the server and start the notification channel
    pub async fn establish(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, McpError> {
        let hub = Arc::new(NotificationHub::new());
        let correlator = Arc::new(RequestCorrelator::new(
            transport.clone(),
            hub.clone(),
            config.request_timeout,
        ));
        let state = Arc::new(SessionStateCell::new());
        state.transition(SessionState::Handshaking);

        info!("Connecting to MCP server at {}", config.endpoint);
        let session = match handshake(&config, &correlator).await {
            Ok(session) => session,
            Err(e) => {
                state.transition(SessionState::Closed);
                correlator.close();
                return Err(e);
            }
        };
        info!(
            "Connected to {} (protocol {}, session {})",
            session.server_info,
            session.protocol_version,
            session.session_id.as_deref().unwrap_or("<none>")
        );

        let manager = Self {
            config,
            transport,
            hub,
            correlator,
            state,
            session: Arc::new(session),
            root: CancellationToken::new(),
            supervisor: Mutex::new(None),
            stream_exhausted: Arc::new(watch::channel(false).0),
        };

        let headers = manager.session.headers();
        if let Err(e) = manager
            .correlator
            .notify(methods::INITIALIZED, None, &headers)
            .await
        {
            warn!("Failed to send initialized notification: {}", e);
        }
        manager.activate();
        Ok(manager)
    }

    /// Rebuild a session from a saved record, verified with `ping`
    ///
    /// Any failure (different server, expired session, network error) falls
    /// back to a fresh handshake.
    pub async fn resume(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        record: &SessionRecord,
    ) -> Result<Self, McpError> {
        if record.server_url != config.endpoint.as_str() {
            debug!(
                "Saved session is for {}, not {}; starting fresh",
                record.server_url, config.endpoint
            );
            return Self::establish(config, transport).await;
        }

        let hub = Arc::new(NotificationHub::new());
        let correlator = Arc::new(RequestCorrelator::new(
            transport.clone(),
            hub.clone(),
            config.request_timeout,
        ));
        let state = Arc::new(SessionStateCell::new());
        state.transition(SessionState::Handshaking);

        let session = Session {
            session_id: record.session_id.clone(),
            protocol_version: record.protocol_version.clone(),
            server_info: record.server_info.clone(),
            capabilities: record.capabilities,
            instructions: None,
        };
        let verified = correlator
            .call(
                methods::PING,
                None,
                &session.headers(),
                &CancellationToken::new(),
            )
            .await;

        match verified {
            Ok(_) => {
                info!(
                    "Resumed session {} with {}",
                    session.session_id.as_deref().unwrap_or("<none>"),
                    session.server_info
                );
                let manager = Self {
                    config,
                    transport,
                    hub,
                    correlator,
                    state,
                    session: Arc::new(session),
                    root: CancellationToken::new(),
                    supervisor: Mutex::new(None),
                    stream_exhausted: Arc::new(watch::channel(false).0),
                };
                manager.activate();
                Ok(manager)
            }
            Err(e) => {
                info!("Saved session is no longer valid ({}); re-initializing", e);
                correlator.close();
                Self::establish(config, transport).await
            }
        }
    }

    /// Go Active and start supervising the notification channel
    fn activate(&self) {
        self.state.transition(SessionState::Active);
        let channel = Arc::new(NotificationChannel::new(
            self.transport.clone(),
            self.session.headers(),
            self.hub.clone(),
            self.correlator.clone(),
            self.config.stream_idle_timeout,
        ));
        let handle = tokio::spawn(supervise(
            channel,
            self.state.clone(),
            self.config.reconnect.clone(),
            self.stream_exhausted.clone(),
            self.root.child_token(),
        ));
        *self.supervisor.lock() = Some(handle);
    }

    pub fn session(&self) -> Arc<Session> {
        self.session.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// True once the event stream is gone for good
    ///
    /// The session stays Degraded and requests keep working over POST, but no
    /// further reconnects happen and server push is lost.
    pub fn stream_exhausted(&self) -> bool {
        *self.stream_exhausted.borrow()
    }

    pub fn watch_stream_exhausted(&self) -> watch::Receiver<bool> {
        self.stream_exhausted.subscribe()
    }

    pub fn hub(&self) -> Arc<NotificationHub> {
        self.hub.clone()
    }

    pub fn notifications(&self) -> NotificationStream {
        self.hub.subscribe()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Local checks run before any network I/O
    pub fn check(&self, method: &str) -> Result<(), McpError> {
        self.state.get().gate()?;
        self.session.capabilities.check(method)
    }

    /// Send a gated request
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        self.check(method)?;
        self.correlator
            .call(method, params, &self.session.headers(), cancel)
            .await
    }

    /// Send a gated request, keeping the raw reply
    pub async fn request_with_reply(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<CallReply, McpError> {
        self.check(method)?;
        self.correlator
            .call_with_reply(method, params, &self.session.headers(), cancel)
            .await
    }

    /// Send a gated notification
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.state.get().gate()?;
        self.correlator
            .notify(method, params, &self.session.headers())
            .await
    }

    /// Close the session: fail pending requests, stop the channel, tell the server
    pub async fn disconnect(&self) {
        if !self.state.transition(SessionState::Closed) {
            return;
        }
        self.root.cancel();
        self.correlator.close();
        self.hub.close();
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        if let Err(e) = self.transport.terminate(&self.session.headers()).await {
            debug!("Session termination not acknowledged: {}", e);
        }
        info!("Disconnected from {}", self.session.server_info);
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.root.cancel();
        self.correlator.close();
    }
}

#[async_trait]
impl RpcCaller for SessionManager {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        SessionManager::request(self, method, params, cancel).await
    }

    fn capabilities(&self) -> CapabilitySet {
        self.session.capabilities
    }
}

async fn handshake(
    config: &ClientConfig,
    correlator: &RequestCorrelator,
) -> Result<Session, McpError> {
    let params = serde_json::to_value(InitializeParams {
        protocol_version: config.protocol_version.clone(),
        capabilities: config.capabilities.clone(),
        client_info: config.client_info.clone(),
    })?;
    let headers = &SessionHeaders::default();
    let cancel = &CancellationToken::new();

    let outcome = with_retry(&config.handshake_retry, "initialize", |attempt| {
        let params = params.clone();
        async move {
            debug!("Handshake attempt {}", attempt);
            let reply = correlator
                .call_with_reply(methods::INITIALIZE, Some(params), headers, cancel)
                .await?;
            session_from_reply(config, reply)
        }
    })
    .await;

    outcome.map_err(|exhausted| McpError::HandshakeFailed {
        attempts: exhausted.attempts,
        reason: exhausted.last_error.to_string(),
    })
}

fn session_from_reply(config: &ClientConfig, reply: CallReply) -> Result<Session, McpError> {
    let result: InitializeResult = serde_json::from_value(reply.result.clone()).map_err(|e| {
        McpError::protocol_with_raw(format!("malformed initialize result: {}", e), &reply.result)
    })?;
    if result.protocol_version != config.protocol_version {
        info!(
            "Server chose protocol version {} (requested {})",
            result.protocol_version, config.protocol_version
        );
    }
    let capabilities = CapabilitySet::negotiate(&config.capabilities, &result.capabilities);
    debug!("Negotiated capabilities: {:?}", capabilities);

    Ok(Session {
        session_id: reply.session_id.or(result.session_id),
        protocol_version: result.protocol_version,
        server_info: result.server_info,
        capabilities,
        instructions: result.instructions,
    })
}

/// Keep the notification channel open for the life of the session
///
/// `Disconnected` moves the session to Degraded and schedules a reconnect
/// with backoff; `Opened` restores Active. In-flight requests are untouched.
/// Giving up (refused stream or spent budget) is published on `exhausted`.
async fn supervise(
    channel: Arc<NotificationChannel>,
    state: Arc<SessionStateCell>,
    reconnect: RetryConfig,
    exhausted: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut last_event_id: Option<String> = None;
    let mut failures: u32 = 0;

    loop {
        let run = channel.run(last_event_id.clone(), &events_tx, &cancel);
        tokio::pin!(run);

        let mut give_up = false;
        let mut on_event = |event: ChannelEvent, failures: &mut u32| match event {
            ChannelEvent::Opened => {
                *failures = 0;
                state.transition(SessionState::Active);
            }
            ChannelEvent::Disconnected { reason, recoverable } => {
                *failures += 1;
                state.transition(SessionState::Degraded);
                if !recoverable {
                    info!("Server offers no event stream ({}); continuing without push", reason);
                    give_up = true;
                }
            }
        };

        let resume_from = loop {
            tokio::select! {
                last = &mut run => break last,
                Some(event) = events_rx.recv() => on_event(event, &mut failures),
            }
        };
        while let Ok(event) = events_rx.try_recv() {
            on_event(event, &mut failures);
        }
        last_event_id = resume_from;

        if cancel.is_cancelled() {
            return;
        }
        if give_up {
            exhausted.send_replace(true);
            return;
        }
        if !reconnect.allows(failures + 1) {
            warn!(
                "Giving up on the event stream after {} attempt(s); session stays degraded",
                failures
            );
            exhausted.send_replace(true);
            return;
        }

        let delay = reconnect.delay_for(failures.max(1));
        debug!("Re-opening event stream in {:?}", delay);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
