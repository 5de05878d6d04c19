//! Resource subscriptions
//!
//! `resources/subscribe` paired with a filtered view of
//! `notifications/resources/updated` for a single URI.

use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::McpError;
use crate::notify::NotificationStream;
use crate::protocol::{methods, JsonRpcNotification};
use crate::session::SessionManager;

/// Update notifications for one resource URI
pub struct ResourceSubscription {
    uri: String,
    updates: NotificationStream,
    manager: Arc<SessionManager>,
}

impl ResourceSubscription {
    pub(super) fn new(
        uri: String,
        updates: NotificationStream,
        manager: Arc<SessionManager>,
    ) -> Self {
        Self {
            uri,
            updates,
            manager,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Next update for this URI; None once the session closes
    pub async fn next_update(&mut self) -> Option<JsonRpcNotification> {
        loop {
            let notification = self.updates.recv().await?;
            if notification.param_str("uri") == Some(self.uri.as_str()) {
                return Some(notification);
            }
        }
    }

    /// Tell the server to stop sending updates
    pub async fn unsubscribe(self) -> Result<(), McpError> {
        self.manager
            .request(
                methods::RESOURCES_UNSUBSCRIBE,
                Some(json!({"uri": self.uri})),
                &CancellationToken::new(),
            )
            .await
            .map(|_| ())
    }
}
