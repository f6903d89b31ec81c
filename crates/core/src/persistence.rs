//! Persistent server state (`server.json`): the groups/clients configuration
//! a server reloads on start and rewrites atomically after any client or
//! group change. Grounded in `original_source/server/config.hpp`'s
//! `Group`/`ClientInfo`/`ClientConfig` structs.
//!
//! The core owns the subset of each object described in §6
//! (group→stream binding, per-client volume/mute/latency/name);
//! every other field round-trips unmodified via a flattened
//! `serde_json::Value` passthrough map so a future RPC/Web-UI layer can
//! extend the schema without this crate clobbering unknown keys.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SnapResult;

/// Per-client volume/mute, mirroring `Volume` in the original config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeState {
    pub percent: u16,
    pub muted: bool,
}

impl Default for VolumeState {
    fn default() -> Self {
        Self { percent: 100, muted: false }
    }
}

/// The subset of a client's configuration the core persists.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ClientConfigState {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub volume: VolumeState,
    #[serde(default)]
    pub latency: i32,

    /// Everything outside the fields above, round-tripped unmodified.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// One known client, keyed by its MAC/host id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientState {
    pub id: String,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub config: ClientConfigState,
    #[serde(default)]
    pub last_seen: Option<Value>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ClientState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connected: false,
            config: ClientConfigState::default(),
            last_seen: None,
            extra: HashMap::new(),
        }
    }
}

/// A group of clients bound to one stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupState {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub stream_id: String,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub clients: Vec<ClientState>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl GroupState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            stream_id: String::new(),
            muted: false,
            clients: Vec::new(),
            extra: HashMap::new(),
        }
    }

    pub fn client(&self, client_id: &str) -> Option<&ClientState> {
        self.clients.iter().find(|c| c.id == client_id)
    }

    pub fn client_mut(&mut self, client_id: &str) -> Option<&mut ClientState> {
        self.clients.iter_mut().find(|c| c.id == client_id)
    }

    pub fn remove_client(&mut self, client_id: &str) -> Option<ClientState> {
        let index = self.clients.iter().position(|c| c.id == client_id)?;
        Some(self.clients.remove(index))
    }
}

/// Top-level `server.json` document.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ServerState {
    #[serde(default)]
    pub server: ServerIdentity,
    #[serde(default)]
    pub groups: Vec<GroupState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ServerIdentity {
    #[serde(default)]
    pub host_id: String,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ServerState {
    /// Finds the group a client currently belongs to.
    pub fn group_for_client(&self, client_id: &str) -> Option<&GroupState> {
        self.groups.iter().find(|g| g.client(client_id).is_some())
    }

    pub fn group_for_client_mut(&mut self, client_id: &str) -> Option<&mut GroupState> {
        self.groups.iter_mut().find(|g| g.client(client_id).is_some())
    }

    pub fn group(&self, group_id: &str) -> Option<&GroupState> {
        self.groups.iter().find(|g| g.id == group_id)
    }

    pub fn group_mut(&mut self, group_id: &str) -> Option<&mut GroupState> {
        self.groups.iter_mut().find(|g| g.id == group_id)
    }

    /// Gets the group for `client_id`, creating a brand new single-client
    /// group if this client has never been seen before.
    pub fn get_or_create_group(&mut self, client_id: &str) -> &mut GroupState {
        if self.group_for_client(client_id).is_none() {
            let mut group = GroupState::new(uuid::Uuid::new_v4().to_string());
            group.clients.push(ClientState::new(client_id));
            self.groups.push(group);
        }
        self.group_for_client_mut(client_id).expect("just inserted")
    }

    pub fn remove_client(&mut self, client_id: &str) {
        for group in &mut self.groups {
            group.remove_client(client_id);
        }
        self.groups.retain(|g| !g.clients.is_empty());
    }
}

/// Owns the on-disk location of `server.json` and serializes writes.
pub struct PersistentStore {
    path: PathBuf,
}

impl PersistentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Loads `server.json`, returning an empty default state if the file
    /// doesn't exist yet (first run).
    pub fn load(&self) -> SnapResult<ServerState> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| crate::error::SnapError::Protocol(format!("malformed server.json: {e}")))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerState::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Serializes `state` and rewrites `server.json` atomically: write to a
    /// sibling temp file, then rename over the target.
    pub fn save(&self, state: &ServerState) -> SnapResult<()> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| crate::error::SnapError::Protocol(format!("failed to serialize server.json: {e}")))?;

        let tmp_path = tmp_path_for(&self.path);
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json_preserving_unknown_fields() {
        let raw = serde_json::json!({
            "server": {"host_id": "abc123", "future_field": 42},
            "groups": [{
                "id": "g1",
                "name": "Living Room",
                "stream_id": "stream-1",
                "muted": false,
                "clients": [{
                    "id": "aa:bb:cc:dd:ee:ff",
                    "connected": true,
                    "config": {"name": "Kitchen", "volume": {"percent": 80, "muted": false}, "latency": 0},
                    "last_seen": {"sec": 100, "usec": 0},
                    "future_client_field": "x"
                }]
            }]
        });

        let state: ServerState = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(state.server.host_id, "abc123");
        assert_eq!(state.server.extra.get("future_field").unwrap(), 42);
        assert_eq!(state.groups[0].clients[0].extra.get("future_client_field").unwrap(), "x");

        let written = serde_json::to_value(&state).unwrap();
        let reparsed: ServerState = serde_json::from_value(written).unwrap();
        assert_eq!(reparsed, state);
    }

    #[test]
    fn get_or_create_group_makes_a_new_single_client_group() {
        let mut state = ServerState::default();
        assert!(state.group_for_client("mac1").is_none());
        state.get_or_create_group("mac1");
        assert!(state.group_for_client("mac1").is_some());
        assert_eq!(state.groups.len(), 1);

        // Second lookup for the same client must not create a duplicate group.
        state.get_or_create_group("mac1");
        assert_eq!(state.groups.len(), 1);
    }

    #[test]
    fn save_then_load_round_trips_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::new(dir.path().join("server.json"));

        let mut state = ServerState::default();
        state.server.host_id = "host-xyz".into();
        state.get_or_create_group("client-1");
        store.save(&state).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn load_of_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::new(dir.path().join("does-not-exist.json"));
        assert_eq!(store.load().unwrap(), ServerState::default());
    }
}
