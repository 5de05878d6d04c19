//! Notification hub
//!
//! Fans inbound notifications out to every subscriber. Each subscriber has
//! its own unbounded queue, so a slow consumer never stalls the stream reader.

use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::trace;

use crate::protocol::JsonRpcNotification;

struct Subscriber {
    /// Only notifications with this method are delivered; None means all
    method: Option<String>,
    tx: mpsc::UnboundedSender<JsonRpcNotification>,
}

/// Fan-out point for server notifications
#[derive(Default)]
pub struct NotificationHub {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every notification published from now on
    pub fn subscribe(&self) -> NotificationStream {
        self.add(None)
    }

    /// Receive only notifications for `method`
    pub fn subscribe_method(&self, method: impl Into<String>) -> NotificationStream {
        self.add(Some(method.into()))
    }

    fn add(&self, method: Option<String>) -> NotificationStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber { method, tx });
        NotificationStream {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    /// Deliver to all matching subscribers, dropping those that went away
    pub fn publish(&self, notification: JsonRpcNotification) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| {
            if sub.method.as_deref().is_some_and(|m| m != notification.method) {
                return !sub.tx.is_closed();
            }
            sub.tx.send(notification.clone()).is_ok()
        });
        trace!(
            "Published {} to {} subscriber(s)",
            notification.method,
            subscribers.len()
        );
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// End every subscriber stream
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }
}

/// Stream of notifications for one subscriber; ends when the session closes
pub struct NotificationStream {
    inner: UnboundedReceiverStream<JsonRpcNotification>,
}

impl NotificationStream {
    pub async fn recv(&mut self) -> Option<JsonRpcNotification> {
        self.inner.next().await
    }
}

impl Stream for NotificationStream {
    type Item = JsonRpcNotification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
