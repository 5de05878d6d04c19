//! Client configuration

use std::time::Duration;
use url::Url;

use crate::error::McpError;
use crate::protocol::{ClientCapabilities, Implementation};
use crate::retry::RetryConfig;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:8000/mcp";
pub const LATEST_PROTOCOL_VERSION: &str = "2025-11-25";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Url,
    pub client_info: Implementation,
    pub capabilities: ClientCapabilities,
    /// Version requested in `initialize`
    pub protocol_version: String,
    /// Per-request deadline
    pub request_timeout: Duration,
    pub handshake_retry: RetryConfig,
    /// Backoff for re-opening the notification stream
    pub reconnect: RetryConfig,
    /// None disables the idle check
    pub stream_idle_timeout: Option<Duration>,
    /// Used when the server gives no `pollInterval`
    pub poll_interval: Duration,
    /// TTL requested for task-augmented calls; None lets the server decide
    pub task_ttl: Option<Duration>,
    /// How long event-driven waits go without a status notification before polling
    pub event_grace: Duration,
}

impl ClientConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            client_info: Implementation::new("mcplink", env!("CARGO_PKG_VERSION")),
            capabilities: ClientCapabilities::default(),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            request_timeout: Duration::from_secs(30),
            handshake_retry: RetryConfig::handshake_default(),
            reconnect: RetryConfig::reconnect_default(),
            stream_idle_timeout: Some(Duration::from_secs(300)),
            poll_interval: Duration::from_secs(1),
            task_ttl: None,
            event_grace: Duration::from_secs(5),
        }
    }

    /// Build from an endpoint string
    pub fn parse(endpoint: &str) -> Result<Self, McpError> {
        let url = Url::parse(endpoint).map_err(|e| {
            McpError::InvalidConfig(format!("invalid server URL '{}': {}", endpoint, e))
        })?;
        match url.scheme() {
            "http" | "https" => Ok(Self::new(url)),
            other => Err(McpError::InvalidConfig(format!(
                "unsupported URL scheme '{}' (expected http or https)",
                other
            ))),
        }
    }

    pub fn with_client_info(mut self, info: Implementation) -> Self {
        self.client_info = info;
        self
    }

    pub fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_handshake_retry(mut self, retry: RetryConfig) -> Self {
        self.handshake_retry = retry;
        self
    }

    pub fn with_reconnect(mut self, retry: RetryConfig) -> Self {
        self.reconnect = retry;
        self
    }

    pub fn with_stream_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_task_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.task_ttl = ttl;
        self
    }

    pub fn with_event_grace(mut self, grace: Duration) -> Self {
        self.event_grace = grace;
        self
    }
}
