//! Server-to-client push: the SSE read loop and subscriber fan-out

mod channel;
mod hub;

pub use channel::{ChannelEvent, NotificationChannel};
pub use hub::{NotificationHub, NotificationStream};
