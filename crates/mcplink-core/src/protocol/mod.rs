//! MCP message model
//!
//! JSON-RPC envelopes, capability negotiation and the typed payloads the
//! client reads.

mod capabilities;
mod jsonrpc;
mod types;

pub use capabilities::{
    Capability, CapabilitySet, ClientCapabilities, ListChangedCapability, ResourcesCapability,
    ServerCapabilities, Supported, TaskRequests, TaskSamplingRequests, TaskToolRequests,
    TasksCapability,
};
pub use jsonrpc::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    ResponseOutcome, RpcErrorCode, RpcErrorObject, Version2, JSONRPC_VERSION,
};
pub use types::{
    cursor_params, CallToolParams, CallToolResult, ContentBlock, GetPromptResult, Implementation,
    InitializeParams, InitializeResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListTasksResult, ListToolsResult, Prompt, PromptArgument, PromptMessage,
    ReadResourceResult, Resource, ResourceContents, ResourceTemplate, Task, TaskReport, TaskStatus,
    Tool,
};

/// Method names the engine sends or routes on
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const RESOURCES_UPDATED: &str = "notifications/resources/updated";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const TASKS_GET: &str = "tasks/get";
    pub const TASKS_RESULT: &str = "tasks/result";
    pub const TASKS_LIST: &str = "tasks/list";
    pub const TASKS_CANCEL: &str = "tasks/cancel";
    pub const TASKS_STATUS: &str = "notifications/tasks/status";
}
