//! Capability declaration and negotiation
//!
//! The client declares what it supports in `initialize`, the server answers
//! with its own set. A feature is usable only when both sides declared it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::McpError;

/// Presence marker: serializes as `{}` and accepts any object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supported {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListChangedCapability {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

impl ListChangedCapability {
    pub fn enabled() -> Self {
        Self {
            list_changed: Some(true),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskToolRequests {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<Supported>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSamplingRequests {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_message: Option<Supported>,
}

/// Which request types may be augmented into tasks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequests {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<TaskToolRequests>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<TaskSamplingRequests>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TasksCapability {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<Supported>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel: Option<Supported>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<TaskRequests>,
}

impl TasksCapability {
    fn tools_call(&self) -> bool {
        self.requests
            .as_ref()
            .and_then(|r| r.tools.as_ref())
            .is_some_and(|t| t.call.is_some())
    }

    fn sampling_create_message(&self) -> bool {
        self.requests
            .as_ref()
            .and_then(|r| r.sampling.as_ref())
            .is_some_and(|s| s.create_message.is_some())
    }
}

/// Capabilities the client declares in `initialize`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Supported>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<ListChangedCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ListChangedCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<TasksCapability>,
}

impl ClientCapabilities {
    /// Declare nothing beyond the base protocol
    pub fn none() -> Self {
        Self {
            experimental: None,
            logging: None,
            prompts: None,
            resources: None,
            tools: None,
            tasks: None,
        }
    }
}

impl Default for ClientCapabilities {
    /// Everything this client knows how to use
    fn default() -> Self {
        Self {
            experimental: None,
            logging: None,
            prompts: Some(ListChangedCapability::enabled()),
            resources: Some(ResourcesCapability {
                subscribe: Some(true),
                list_changed: Some(true),
            }),
            tools: Some(ListChangedCapability::enabled()),
            tasks: Some(TasksCapability {
                list: Some(Supported {}),
                cancel: Some(Supported {}),
                requests: Some(TaskRequests {
                    tools: Some(TaskToolRequests {
                        call: Some(Supported {}),
                    }),
                    sampling: Some(TaskSamplingRequests {
                        create_message: Some(Supported {}),
                    }),
                }),
            }),
        }
    }
}

/// Capabilities the server returns from `initialize`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Supported>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completions: Option<Supported>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<ListChangedCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ListChangedCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<TasksCapability>,
}

/// A single negotiable feature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Tools,
    Resources,
    ResourcesSubscribe,
    Prompts,
    Logging,
    Tasks,
    TasksList,
    TasksCancel,
    TasksToolsCall,
    TasksSamplingCreateMessage,
}

impl Capability {
    pub fn name(self) -> &'static str {
        match self {
            Capability::Tools => "tools",
            Capability::Resources => "resources",
            Capability::ResourcesSubscribe => "resources.subscribe",
            Capability::Prompts => "prompts",
            Capability::Logging => "logging",
            Capability::Tasks => "tasks",
            Capability::TasksList => "tasks.list",
            Capability::TasksCancel => "tasks.cancel",
            Capability::TasksToolsCall => "tasks.requests.tools.call",
            Capability::TasksSamplingCreateMessage => "tasks.requests.sampling.createMessage",
        }
    }

    /// Capability a method needs before it may be sent, if any
    pub fn required_for(method: &str) -> Option<Capability> {
        match method {
            "tools/list" | "tools/call" => Some(Capability::Tools),
            "resources/list" | "resources/read" | "resources/templates/list" => {
                Some(Capability::Resources)
            }
            "resources/subscribe" | "resources/unsubscribe" => Some(Capability::ResourcesSubscribe),
            "prompts/list" | "prompts/get" => Some(Capability::Prompts),
            "logging/setLevel" => Some(Capability::Logging),
            "tasks/get" | "tasks/result" => Some(Capability::Tasks),
            "tasks/list" => Some(Capability::TasksList),
            "tasks/cancel" => Some(Capability::TasksCancel),
            _ => None,
        }
    }

    /// Capability needed to run `method` as a task
    pub fn for_task_augmentation(method: &str) -> Option<Capability> {
        match method {
            "tools/call" => Some(Capability::TasksToolsCall),
            "sampling/createMessage" => Some(Capability::TasksSamplingCreateMessage),
            _ => None,
        }
    }
}

/// Negotiated feature flags: client-declared AND server-declared
///
/// Immutable once the handshake completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySet {
    pub tools: bool,
    pub tools_list_changed: bool,
    pub resources: bool,
    pub resources_subscribe: bool,
    pub resources_list_changed: bool,
    pub prompts: bool,
    pub prompts_list_changed: bool,
    pub logging: bool,
    pub tasks: bool,
    pub tasks_list: bool,
    pub tasks_cancel: bool,
    pub tasks_tools_call: bool,
    pub tasks_sampling_create_message: bool,
}

fn list_changed(cap: &Option<ListChangedCapability>) -> bool {
    cap.as_ref()
        .and_then(|c| c.list_changed)
        .unwrap_or(false)
}

impl CapabilitySet {
    pub fn negotiate(client: &ClientCapabilities, server: &ServerCapabilities) -> Self {
        let client_resources = client.resources.clone().unwrap_or_default();
        let server_resources = server.resources.clone().unwrap_or_default();
        let client_tasks = client.tasks.as_ref();
        let server_tasks = server.tasks.as_ref();
        let both_tasks = |f: fn(&TasksCapability) -> bool| {
            client_tasks.is_some_and(f) && server_tasks.is_some_and(f)
        };

        Self {
            tools: client.tools.is_some() && server.tools.is_some(),
            tools_list_changed: list_changed(&client.tools) && list_changed(&server.tools),
            resources: client.resources.is_some() && server.resources.is_some(),
            resources_subscribe: client_resources.subscribe.unwrap_or(false)
                && server_resources.subscribe.unwrap_or(false),
            resources_list_changed: client_resources.list_changed.unwrap_or(false)
                && server_resources.list_changed.unwrap_or(false),
            prompts: client.prompts.is_some() && server.prompts.is_some(),
            prompts_list_changed: list_changed(&client.prompts) && list_changed(&server.prompts),
            logging: client.logging.is_some() && server.logging.is_some(),
            tasks: client_tasks.is_some() && server_tasks.is_some(),
            tasks_list: both_tasks(|t| t.list.is_some()),
            tasks_cancel: both_tasks(|t| t.cancel.is_some()),
            tasks_tools_call: both_tasks(TasksCapability::tools_call),
            tasks_sampling_create_message: both_tasks(TasksCapability::sampling_create_message),
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Tools => self.tools,
            Capability::Resources => self.resources,
            Capability::ResourcesSubscribe => self.resources_subscribe,
            Capability::Prompts => self.prompts,
            Capability::Logging => self.logging,
            Capability::Tasks => self.tasks,
            Capability::TasksList => self.tasks_list,
            Capability::TasksCancel => self.tasks_cancel,
            Capability::TasksToolsCall => self.tasks_tools_call,
            Capability::TasksSamplingCreateMessage => self.tasks_sampling_create_message,
        }
    }

    /// Reject a method outside the negotiated set
    ///
    /// Methods with no capability requirement (`ping`, notifications,
    /// unknown methods) always pass; the server decides about those.
    pub fn check(&self, method: &str) -> Result<(), McpError> {
        match Capability::required_for(method) {
            Some(cap) if !self.supports(cap) => Err(McpError::CapabilityNotNegotiated {
                method: method.to_string(),
                capability: cap.name(),
            }),
            _ => Ok(()),
        }
    }

    /// Reject a task-augmented call the server did not agree to run as a task
    pub fn check_task_augmentation(&self, method: &str) -> Result<(), McpError> {
        self.check(method)?;
        match Capability::for_task_augmentation(method) {
            Some(cap) if self.supports(cap) => Ok(()),
            Some(cap) => Err(McpError::CapabilityNotNegotiated {
                method: method.to_string(),
                capability: cap.name(),
            }),
            None => Err(McpError::CapabilityNotNegotiated {
                method: method.to_string(),
                capability: "tasks.requests",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn server(value: Value) -> ServerCapabilities {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_default_client_declaration_shape() {
        let json = serde_json::to_value(ClientCapabilities::default()).unwrap();
        assert_eq!(json["resources"], json!({"subscribe": true, "listChanged": true}));
        assert_eq!(json["tasks"]["requests"]["tools"]["call"], json!({}));
        assert!(json.get("logging").is_none());
        assert!(json.get("experimental").is_none());
    }

    #[test]
    fn test_negotiation_is_intersection() {
        let server = server(json!({
            "tools": {"listChanged": false},
            "resources": {"subscribe": true},
            "logging": {}
        }));
        let set = CapabilitySet::negotiate(&ClientCapabilities::default(), &server);
        assert!(set.tools);
        assert!(!set.tools_list_changed);
        assert!(set.resources);
        assert!(set.resources_subscribe);
        assert!(!set.resources_list_changed);
        assert!(!set.prompts);
        // Client did not declare logging
        assert!(!set.logging);
        assert!(!set.tasks);
    }

    #[test]
    fn test_omitted_server_capability_blocks_method() {
        let server = server(json!({"resources": {}}));
        let set = CapabilitySet::negotiate(&ClientCapabilities::default(), &server);
        assert!(set.check("resources/list").is_ok());
        let err = set.check("resources/subscribe").unwrap_err();
        assert!(matches!(
            err,
            McpError::CapabilityNotNegotiated { capability: "resources.subscribe", .. }
        ));
    }

    #[test]
    fn test_unrestricted_methods_pass() {
        let set = CapabilitySet::default();
        assert!(set.check("ping").is_ok());
        assert!(set.check("vendor/custom").is_ok());
        assert!(set.check("tools/list").is_err());
    }

    #[test]
    fn test_task_augmentation_requires_specific_flag() {
        let server = server(json!({
            "tools": {},
            "tasks": {"list": {}, "cancel": {}, "requests": {"sampling": {"createMessage": {}}}}
        }));
        let set = CapabilitySet::negotiate(&ClientCapabilities::default(), &server);
        assert!(set.tasks_cancel);
        assert!(set.tasks_sampling_create_message);
        let err = set.check_task_augmentation("tools/call").unwrap_err();
        assert!(matches!(
            err,
            McpError::CapabilityNotNegotiated { capability: "tasks.requests.tools.call", .. }
        ));
        assert!(set.check_task_augmentation("sampling/createMessage").is_ok());
        assert!(set.check_task_augmentation("prompts/get").is_err());
    }
}
