//! Most-recently-used list of servers the client has connected to

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::session::SessionError;

/// Servers kept in the list
pub const MAX_KNOWN_SERVERS: usize = 16;

/// A server the client has completed a handshake with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownServer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// MRU server list, optionally persisted as JSON
#[derive(Debug, Clone, Default)]
pub struct KnownServers {
    servers: Vec<KnownServer>,
    path: Option<PathBuf>,
}

impl KnownServers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`; a missing file gives an empty list that will be
    /// saved there
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref().to_path_buf();
        let servers = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| SessionError::Persistence(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(SessionError::Persistence(format!("{}: {e}", path.display()))),
        };
        Ok(Self {
            servers,
            path: Some(path),
        })
    }

    /// Write the list to its file, if it has one
    pub fn save(&self) -> Result<(), SessionError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = serde_json::to_vec_pretty(&self.servers)
            .map_err(|e| SessionError::Persistence(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SessionError::Persistence(format!("{}: {e}", parent.display())))?;
        }
        std::fs::write(path, data)
            .map_err(|e| SessionError::Persistence(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), count = self.servers.len(), "Known servers saved");
        Ok(())
    }

    /// Move `name` to the front, updating its credential when one is given
    pub fn remember(&mut self, name: &str, credential: Option<String>) {
        let existing = self
            .servers
            .iter()
            .position(|s| s.name == name)
            .map(|i| self.servers.remove(i));
        let credential = credential.or_else(|| existing.and_then(|s| s.credential));
        self.servers.insert(
            0,
            KnownServer {
                name: name.to_string(),
                credential,
            },
        );
        self.servers.truncate(MAX_KNOWN_SERVERS);
    }

    pub fn forget(&mut self, name: &str) -> bool {
        let before = self.servers.len();
        self.servers.retain(|s| s.name != name);
        self.servers.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.servers.iter().any(|s| s.name == name)
    }

    pub fn credential(&self, name: &str) -> Option<&str> {
        self.servers
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| s.credential.as_deref())
    }

    /// Names, most recent first
    pub fn names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }

    pub fn servers(&self) -> &[KnownServer] {
        &self.servers
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_most_recent_first() {
        let mut servers = KnownServers::new();
        servers.remember("Mac-1", None);
        servers.remember("Mac-2", Some("1234".into()));
        servers.remember("Mac-1", None);
        assert_eq!(servers.names(), vec!["Mac-1", "Mac-2"]);
        assert_eq!(servers.credential("Mac-2"), Some("1234"));
    }

    #[test]
    fn test_credential_survives_reconnect_without_one() {
        let mut servers = KnownServers::new();
        servers.remember("Mac-1", Some("secret".into()));
        servers.remember("Mac-1", None);
        assert_eq!(servers.credential("Mac-1"), Some("secret"));
        assert!(servers.forget("Mac-1"));
        assert!(servers.is_empty());
    }

    #[test]
    fn test_list_is_bounded() {
        let mut servers = KnownServers::new();
        for i in 0..MAX_KNOWN_SERVERS + 5 {
            servers.remember(&format!("server-{i}"), None);
        }
        assert_eq!(servers.servers().len(), MAX_KNOWN_SERVERS);
        assert_eq!(servers.names()[0], format!("server-{}", MAX_KNOWN_SERVERS + 4));
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("remote").join("servers.json");

        let mut servers = KnownServers::load(&path).unwrap();
        assert!(servers.is_empty());
        servers.remember("Mac-1", Some("pass".into()));
        servers.save().unwrap();

        let loaded = KnownServers::load(&path).unwrap();
        assert_eq!(loaded.servers(), servers.servers());
    }
}
