//! CLI configuration file
//!
//! `~/.mcplink/config.toml`, all keys optional:
//!
//! ```toml
//! server_url = "http://localhost:8000/mcp"
//! request_timeout_secs = 30
//! poll_interval_ms = 1000
//! task_ttl_secs = 600
//! sessions_file = "/home/me/.mcplink/sessions.json"
//! ```

use anyhow::{Context, Result};
use mcplink_core::{ClientConfig, SessionStore, DEFAULT_ENDPOINT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub server_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub task_ttl_secs: Option<u64>,
    pub sessions_file: Option<PathBuf>,
}

impl CliConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".mcplink").join("config.toml"))
    }

    /// Load `path`, or the default file when present
    ///
    /// An explicit path must exist; a missing default file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from(&path),
                _ => {
                    debug!("No config file; using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Engine config with command-line values taking precedence
    pub fn client_config(
        &self,
        server_url: Option<&str>,
        timeout_secs: Option<u64>,
    ) -> Result<ClientConfig> {
        let url = server_url
            .or(self.server_url.as_deref())
            .unwrap_or(DEFAULT_ENDPOINT);
        let mut config = ClientConfig::parse(url)?;

        if let Some(secs) = timeout_secs.or(self.request_timeout_secs) {
            config = config.with_request_timeout(Duration::from_secs(secs));
        }
        if let Some(ms) = self.poll_interval_ms {
            config = config.with_poll_interval(Duration::from_millis(ms));
        }
        if let Some(secs) = self.task_ttl_secs {
            config = config.with_task_ttl(Some(Duration::from_secs(secs)));
        }
        Ok(config)
    }

    pub fn sessions_path(&self) -> Result<PathBuf> {
        match &self.sessions_file {
            Some(path) => Ok(path.clone()),
            None => SessionStore::default_path().context("Could not determine home directory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "server_url = \"https://mcp.example.com/mcp\"\nrequest_timeout_secs = 5\n",
        )
        .unwrap();

        let config = CliConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(config.server_url.as_deref(), Some("https://mcp.example.com/mcp"));
        assert_eq!(config.request_timeout_secs, Some(5));
        assert_eq!(config.task_ttl_secs, None);
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(CliConfig::load(Some(dir.path().join("nope.toml").as_path())).is_err());
    }

    #[test]
    fn test_flags_override_file() {
        let config = CliConfig {
            server_url: Some("http://from-file:9000/mcp".to_string()),
            request_timeout_secs: Some(5),
            task_ttl_secs: Some(60),
            ..CliConfig::default()
        };
        let client = config
            .client_config(Some("http://from-flag:7000/mcp"), Some(12))
            .unwrap();
        assert_eq!(client.endpoint.as_str(), "http://from-flag:7000/mcp");
        assert_eq!(client.request_timeout, Duration::from_secs(12));
        assert_eq!(client.task_ttl, Some(Duration::from_secs(60)));

        let fallback = CliConfig::default().client_config(None, None).unwrap();
        assert_eq!(fallback.endpoint.as_str(), DEFAULT_ENDPOINT);
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(CliConfig::default()
            .client_config(Some("ftp://example.com"), None)
            .is_err());
    }
}
