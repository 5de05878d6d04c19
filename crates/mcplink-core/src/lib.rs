//! mcplink-core: Model Context Protocol client engine
//!
//! JSON-RPC 2.0 over Streamable HTTP: POST for requests, a long-lived SSE
//! stream for server push. The engine owns the session lifecycle, request
//! correlation, notification fan-out and task orchestration.

pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod notify;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod store;
pub mod tasks;
pub mod transport;

pub use client::{AsyncCall, McpClient, ResourceSubscription};
pub use config::{ClientConfig, DEFAULT_ENDPOINT, LATEST_PROTOCOL_VERSION};
pub use error::McpError;
pub use notify::NotificationStream;
pub use session::{Session, SessionState};
pub use store::{SessionRecord, SessionStore};
pub use tasks::{AwaitMode, TaskHandle, TaskOutcome};

#[cfg(test)]
pub(crate) mod test_support;
