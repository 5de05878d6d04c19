//! Long-running server tasks

mod orchestrator;

pub use orchestrator::{AwaitMode, TaskHandle, TaskOrchestrator, TaskOutcome};
