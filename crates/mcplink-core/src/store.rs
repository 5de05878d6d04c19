//! Saved sessions
//!
//! One record per server URL, kept in `~/.mcplink/sessions.json` so a later
//! process can skip the handshake when the server still knows the session.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::protocol::{CapabilitySet, Implementation};
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub server_url: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub protocol_version: String,
    pub server_info: Implementation,
    pub capabilities: CapabilitySet,
    pub saved_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn from_session(server_url: &str, session: &Session) -> Self {
        Self {
            server_url: server_url.to_string(),
            session_id: session.session_id.clone(),
            protocol_version: session.protocol_version.clone(),
            server_info: session.server_info.clone(),
            capabilities: session.capabilities,
            saved_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    sessions: BTreeMap<String, SessionRecord>,
}

pub struct SessionStore {
    path: PathBuf,
    file: RwLock<StoreFile>,
}

impl SessionStore {
    /// `~/.mcplink/sessions.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".mcplink").join("sessions.json"))
    }

    /// Load the store; a missing or unreadable file starts empty
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = if path.exists() {
            let content = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match serde_json::from_str::<StoreFile>(&content) {
                Ok(file) => {
                    debug!(
                        "SessionStore: loaded {} record(s) from {:?}",
                        file.sessions.len(),
                        path
                    );
                    file
                }
                Err(e) => {
                    warn!("SessionStore: ignoring corrupt file {:?}: {}", path, e);
                    StoreFile::default()
                }
            }
        } else {
            debug!("SessionStore: no file at {:?}", path);
            StoreFile::default()
        };

        Ok(Self {
            path,
            file: RwLock::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, server_url: &str) -> Option<SessionRecord> {
        self.file.read().await.sessions.get(server_url).cloned()
    }

    pub async fn list(&self) -> Vec<SessionRecord> {
        self.file.read().await.sessions.values().cloned().collect()
    }

    /// Insert or replace the record for its server and persist
    pub async fn put(&self, record: SessionRecord) -> Result<()> {
        let mut file = self.file.write().await;
        info!("SessionStore: saving session for {}", record.server_url);
        file.sessions.insert(record.server_url.clone(), record);
        self.save(&file).await
    }

    /// Forget a server's session; returns whether one existed
    pub async fn remove(&self, server_url: &str) -> Result<bool> {
        let mut file = self.file.write().await;
        if file.sessions.remove(server_url).is_none() {
            return Ok(false);
        }
        self.save(&file).await?;
        Ok(true)
    }

    /// Write to disk with owner-only permissions
    async fn save(&self, file: &StoreFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(file)?;
        fs::write(&self.path, json)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = fs::metadata(&self.path).await?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o600);
            fs::set_permissions(&self.path, permissions).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(url: &str) -> SessionRecord {
        SessionRecord {
            server_url: url.to_string(),
            session_id: Some("abc123".to_string()),
            protocol_version: "2025-11-25".to_string(),
            server_info: Implementation::new("demo", "1.0.0"),
            capabilities: CapabilitySet {
                tools: true,
                ..CapabilitySet::default()
            },
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("sessions.json");

        let store = SessionStore::open(&path).await.unwrap();
        store.put(record("http://a/mcp")).await.unwrap();
        store.put(record("http://b/mcp")).await.unwrap();

        let reopened = SessionStore::open(&path).await.unwrap();
        let loaded = reopened.get("http://a/mcp").await.unwrap();
        assert_eq!(loaded, record_with_time(&loaded));
        assert!(loaded.capabilities.tools);
        assert_eq!(reopened.list().await.len(), 2);
    }

    fn record_with_time(loaded: &SessionRecord) -> SessionRecord {
        SessionRecord {
            saved_at: loaded.saved_at,
            ..record(&loaded.server_url)
        }
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path().join("s.json")).await.unwrap();
        store.put(record("http://a/mcp")).await.unwrap();
        assert!(store.remove("http://a/mcp").await.unwrap());
        assert!(!store.remove("http://a/mcp").await.unwrap());
        assert!(store.get("http://a/mcp").await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = SessionStore::open(&path).await.unwrap();
        assert!(store.list().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        let store = SessionStore::open(&path).await.unwrap();
        store.put(record("http://a/mcp")).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
