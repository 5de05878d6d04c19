//! Typed request helpers

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::{AsyncCall, McpClient};
use crate::error::McpError;
use crate::protocol::{
    cursor_params, methods, CallToolParams, CallToolResult, GetPromptResult, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListTasksResult, ListToolsResult,
    ReadResourceResult,
};
use crate::tasks::{AwaitMode, TaskOutcome};

fn parse<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, McpError> {
    serde_json::from_value(value.clone()).map_err(|e| {
        McpError::protocol_with_raw(format!("malformed {} result: {}", method, e), &value)
    })
}

impl McpClient {
    pub async fn ping(&self) -> Result<(), McpError> {
        self.call(methods::PING, None).await.map(|_| ())
    }

    pub async fn list_tools(&self, cursor: Option<&str>) -> Result<ListToolsResult, McpError> {
        let value = self.call(methods::TOOLS_LIST, cursor_params(cursor)).await?;
        parse(methods::TOOLS_LIST, value)
    }

    /// Invoke a tool, as a task when the server agreed to run tool calls as tasks
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, McpError> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;

        if !self.session().capabilities.tasks_tools_call {
            let value = self.call(methods::TOOLS_CALL, Some(params)).await?;
            return parse(methods::TOOLS_CALL, value);
        }

        let value = match self.call_async(methods::TOOLS_CALL, Some(params)).await? {
            AsyncCall::Ready(value) => value,
            AsyncCall::Task(handle) => match self.await_task(&handle, AwaitMode::Events).await? {
                TaskOutcome::Completed(value) => value,
                TaskOutcome::InputRequired(task) => {
                    self.tasks.release(&handle);
                    return Err(McpError::InputRequired {
                        task_id: task.task_id,
                        message: task
                            .status_message
                            .unwrap_or_else(|| "tool requested input".to_string()),
                    });
                }
            },
        };
        parse(methods::TOOLS_CALL, value)
    }

    pub async fn list_resources(
        &self,
        cursor: Option<&str>,
    ) -> Result<ListResourcesResult, McpError> {
        let value = self
            .call(methods::RESOURCES_LIST, cursor_params(cursor))
            .await?;
        parse(methods::RESOURCES_LIST, value)
    }

    pub async fn list_resource_templates(
        &self,
        cursor: Option<&str>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        let value = self
            .call(methods::RESOURCES_TEMPLATES_LIST, cursor_params(cursor))
            .await?;
        parse(methods::RESOURCES_TEMPLATES_LIST, value)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        let value = self
            .call(methods::RESOURCES_READ, Some(json!({"uri": uri})))
            .await?;
        parse(methods::RESOURCES_READ, value)
    }

    pub async fn list_prompts(&self, cursor: Option<&str>) -> Result<ListPromptsResult, McpError> {
        let value = self
            .call(methods::PROMPTS_LIST, cursor_params(cursor))
            .await?;
        parse(methods::PROMPTS_LIST, value)
    }

    /// `arguments` is an object of string values
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<GetPromptResult, McpError> {
        let mut params = json!({"name": name});
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        let value = self.call(methods::PROMPTS_GET, Some(params)).await?;
        parse(methods::PROMPTS_GET, value)
    }

    pub async fn list_tasks(&self, cursor: Option<&str>) -> Result<ListTasksResult, McpError> {
        let value = self.call(methods::TASKS_LIST, cursor_params(cursor)).await?;
        parse(methods::TASKS_LIST, value)
    }
}
