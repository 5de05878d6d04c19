//! Notification channel
//!
//! Reads the long-lived SSE stream and routes each message: notifications
//! to the hub, responses to the correlator. Runs as its own task and never
//! waits on request traffic.

use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hub::NotificationHub;
use crate::correlator::RequestCorrelator;
use crate::error::McpError;
use crate::protocol::JsonRpcMessage;
use crate::retry::IsRetryable;
use crate::transport::{ByteStream, SessionHeaders, SseDecoder, SseFrame, Transport};

/// Lifecycle signals consumed by the session supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    /// `recoverable` is false when the server refused the stream outright
    Disconnected { reason: String, recoverable: bool },
}

pub struct NotificationChannel {
    transport: Arc<dyn Transport>,
    headers: SessionHeaders,
    hub: Arc<NotificationHub>,
    correlator: Arc<RequestCorrelator>,
    /// Treat the stream as dead after this long without bytes
    idle_timeout: Option<Duration>,
}

impl NotificationChannel {
    pub fn new(
        transport: Arc<dyn Transport>,
        headers: SessionHeaders,
        hub: Arc<NotificationHub>,
        correlator: Arc<RequestCorrelator>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            headers,
            hub,
            correlator,
            idle_timeout,
        }
    }

    /// Open the stream and pump it until it ends or `cancel` fires
    ///
    /// Sends `Opened` once connected and `Disconnected` when the stream fails
    /// or ends. Deliberate cancellation reports nothing.
    pub async fn run(
        &self,
        last_event_id: Option<String>,
        events: &mpsc::UnboundedSender<ChannelEvent>,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return last_event_id,
            result = self.transport.open_stream(&self.headers, last_event_id.as_deref()) => result,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                let _ = events.send(ChannelEvent::Disconnected {
                    reason: e.to_string(),
                    recoverable: e.is_retryable(),
                });
                return last_event_id;
            }
        };
        info!("Notification channel open");
        let _ = events.send(ChannelEvent::Opened);

        let mut decoder = SseDecoder::new();
        let mut last_event_id = last_event_id;
        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Notification channel stopped after {} frame(s)", decoder.frame_count());
                    return last_event_id;
                }
                next = self.next_chunk(&mut stream) => next,
            };
            match next {
                Ok(Some(chunk)) => {
                    for frame in decoder.feed(&chunk) {
                        self.dispatch(&frame);
                    }
                    if let Some(id) = decoder.last_event_id() {
                        last_event_id = Some(id.to_string());
                    }
                }
                Ok(None) => {
                    if let Some(frame) = decoder.finish() {
                        self.dispatch(&frame);
                    }
                    break "stream closed by server".to_string();
                }
                Err(e) => break e.to_string(),
            }
        };

        warn!("Notification channel lost: {}", reason);
        let _ = events.send(ChannelEvent::Disconnected {
            reason,
            recoverable: true,
        });
        last_event_id
    }

    async fn next_chunk(&self, stream: &mut ByteStream) -> Result<Option<Bytes>, McpError> {
        match self.idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, stream.next()).await {
                Ok(next) => next.transpose(),
                Err(_) => Err(McpError::transport(format!(
                    "no data on event stream for {:?}",
                    idle
                ))),
            },
            None => stream.next().await.transpose(),
        }
    }

    fn dispatch(&self, frame: &SseFrame) {
        if !frame.is_message() {
            debug!(
                "Skipping SSE event '{}'",
                frame.event.as_deref().unwrap_or_default()
            );
            return;
        }
        if frame.data.trim().is_empty() {
            return;
        }
        match JsonRpcMessage::parse(&frame.data) {
            Ok(JsonRpcMessage::Notification(notification)) => {
                debug!(method = %notification.method, "Notification received");
                self.hub.publish(notification);
            }
            Ok(JsonRpcMessage::Response(response)) => {
                self.correlator.deliver(response);
            }
            Ok(JsonRpcMessage::Request(request)) => {
                warn!(
                    "Ignoring server request '{}' (id {}): not supported by this client",
                    request.method, request.id
                );
            }
            Err(e) => warn!("Discarding malformed message on event stream: {}", e),
        }
    }
}
