//! Subcommand execution

use anyhow::{bail, Context, Result};
use mcplink_core::{ClientConfig, McpClient, SessionStore};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::CliConfig;
use crate::{Cli, Command};

pub async fn run(cli: Cli, config: CliConfig) -> Result<()> {
    let client_config = config.client_config(cli.server_url.as_deref(), cli.timeout)?;
    let store = SessionStore::open(config.sessions_path()?).await?;
    let server_url = client_config.endpoint.to_string();

    let client = match cli.command {
        Command::Forget => {
            if store.remove(&server_url).await? {
                println!("Forgot session for {}", server_url);
            } else {
                println!("No saved session for {}", server_url);
            }
            return Ok(());
        }
        Command::Init => McpClient::connect(client_config)
            .await
            .with_context(|| format!("Failed to connect to {}", server_url))?,
        _ => connect(&store, client_config, &server_url).await?,
    };

    let outcome = execute(&client, cli.command).await;
    if let Err(e) = store.put(client.record()).await {
        warn!("Could not save session: {:#}", e);
    }
    outcome
}

/// Reuse the saved session when there is one
async fn connect(store: &SessionStore, config: ClientConfig, server_url: &str) -> Result<McpClient> {
    let client = match store.get(server_url).await {
        Some(record) => McpClient::resume(config, &record).await,
        None => McpClient::connect(config).await,
    };
    client.with_context(|| format!("Failed to connect to {}", server_url))
}

async fn execute(client: &McpClient, command: Command) -> Result<()> {
    match command {
        Command::Init => {
            let session = client.session();
            info!("Session saved for {}", client.server_url());
            print_json(&*session)
        }
        Command::Ping => {
            client.ping().await?;
            println!("pong from {}", client.session().server_info);
            Ok(())
        }
        Command::ToolsList { cursor } => print_json(&client.list_tools(cursor.as_deref()).await?),
        Command::ToolsCall { name, arguments } => {
            let arguments = parse_json_arg("arguments", arguments.as_deref())?;
            let result = client.call_tool(&name, arguments).await?;
            print_json(&result)?;
            if result.is_error {
                bail!("tool '{}' reported an error", name);
            }
            Ok(())
        }
        Command::ResourcesList { cursor } => {
            print_json(&client.list_resources(cursor.as_deref()).await?)
        }
        Command::ResourcesRead { uri } => print_json(&client.read_resource(&uri).await?),
        Command::ResourcesTemplates { cursor } => {
            print_json(&client.list_resource_templates(cursor.as_deref()).await?)
        }
        Command::PromptsList { cursor } => print_json(&client.list_prompts(cursor.as_deref()).await?),
        Command::PromptsGet { name, arguments } => {
            let arguments = parse_json_arg("arguments", arguments.as_deref())?;
            print_json(&client.get_prompt(&name, arguments).await?)
        }
        Command::Subscribe { uri, count } => subscribe(client, &uri, count).await,
        Command::TasksList { cursor } => print_json(&client.list_tasks(cursor.as_deref()).await?),
        Command::Forget => Ok(()),
    }
}

async fn subscribe(client: &McpClient, uri: &str, count: Option<usize>) -> Result<()> {
    let mut subscription = client.subscribe_resource(uri).await?;
    eprintln!("Subscribed to {}; waiting for updates (Ctrl-C to stop)", uri);

    let mut seen = 0;
    loop {
        if count.is_some_and(|limit| seen >= limit) {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = subscription.next_update() => match update {
                Some(notification) => {
                    seen += 1;
                    print_json(&json!({
                        "method": notification.method,
                        "params": notification.params,
                    }))?;
                }
                None => {
                    warn!("Session closed while subscribed");
                    return Ok(());
                }
            },
        }
    }
    subscription.unsubscribe().await?;
    Ok(())
}

/// Parse an optional JSON object flag
fn parse_json_arg(flag: &str, raw: Option<&str>) -> Result<Option<Value>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("--{} is not valid JSON", flag))?;
    if !value.is_object() {
        bail!("--{} must be a JSON object", flag);
    }
    Ok(Some(value))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_arg() {
        assert_eq!(parse_json_arg("arguments", None).unwrap(), None);
        assert_eq!(
            parse_json_arg("arguments", Some(r#"{"text":"hi"}"#)).unwrap(),
            Some(json!({"text": "hi"}))
        );
        assert!(parse_json_arg("arguments", Some("[1]")).is_err());
        assert!(parse_json_arg("arguments", Some("{oops")).is_err());
    }
}
