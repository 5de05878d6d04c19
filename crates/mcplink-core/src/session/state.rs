//! Session state tracking
//!
//! `Unconnected → Handshaking → Active ⇄ Degraded → Closed`, published through
//! a watch channel so callers can observe transitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::McpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unconnected,
    Handshaking,
    Active,
    /// Notification stream lost; requests still flow over POST
    Degraded,
    Closed,
}

impl SessionState {
    /// Requests other than `initialize` may only be sent in these states
    pub fn accepts_requests(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Degraded)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Unconnected, Handshaking) => true,
            (Handshaking, Active) => true,
            (Active, Degraded) | (Degraded, Active) => true,
            _ => false,
        }
    }

    /// Local gate evaluated before any request is sent
    pub fn gate(self) -> Result<(), McpError> {
        match self {
            s if s.accepts_requests() => Ok(()),
            SessionState::Closed => Err(McpError::SessionClosed),
            state => Err(McpError::NotConnected { state }),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Unconnected => "unconnected",
            SessionState::Handshaking => "handshaking",
            SessionState::Active => "active",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Current state plus its watch channel
#[derive(Debug)]
pub struct SessionStateCell {
    tx: watch::Sender<SessionState>,
}

impl SessionStateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Unconnected);
        Self { tx }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Move to `next` if the machine allows it; returns whether it moved
    pub fn transition(&self, next: SessionState) -> bool {
        let mut previous = None;
        self.tx.send_if_modified(|current| {
            if *current == next || !current.can_transition_to(next) {
                return false;
            }
            previous = Some(*current);
            *current = next;
            true
        });
        match previous {
            Some(from) => {
                info!("Session state: {} -> {}", from, next);
                true
            }
            None => {
                debug!("Session state: ignored transition to {} (at {})", next, self.get());
                false
            }
        }
    }
}

impl Default for SessionStateCell {
    fn default() -> Self {
        Self::new()
    }
}
