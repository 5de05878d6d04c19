//! mcplink - command-line client for MCP servers over Streamable HTTP

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;

#[derive(Debug, Parser)]
#[command(name = "mcplink", version, about = "Talk to MCP servers over HTTP")]
pub struct Cli {
    /// Server endpoint; falls back to the config file, then http://localhost:8000/mcp
    #[arg(long, env = "MCPLINK_SERVER_URL", global = true)]
    server_url: Option<String>,

    /// Config file (default ~/.mcplink/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a new session and save it
    Init,
    Ping,
    ToolsList {
        #[arg(long)]
        cursor: Option<String>,
    },
    ToolsCall {
        name: String,
        /// Tool arguments as a JSON object, e.g. `{"text":"hello"}`
        #[arg(long)]
        arguments: Option<String>,
    },
    ResourcesList {
        #[arg(long)]
        cursor: Option<String>,
    },
    ResourcesRead {
        uri: String,
    },
    ResourcesTemplates {
        #[arg(long)]
        cursor: Option<String>,
    },
    PromptsList {
        #[arg(long)]
        cursor: Option<String>,
    },
    PromptsGet {
        name: String,
        /// Prompt arguments as a JSON object of strings
        #[arg(long)]
        arguments: Option<String>,
    },
    /// Print update notifications for a resource until Ctrl-C
    Subscribe {
        uri: String,
        /// Stop after this many updates
        #[arg(long)]
        count: Option<usize>,
    },
    TasksList {
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Drop the saved session for the server
    Forget,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcplink=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref())?;
    commands::run(cli, config).await
}
