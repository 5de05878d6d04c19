//! Session lifecycle: state machine, handshake, channel supervision

mod manager;
mod state;

pub use manager::{RpcCaller, Session, SessionManager};
pub use state::{SessionState, SessionStateCell};
