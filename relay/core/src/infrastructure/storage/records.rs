// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Record store: a sled tree keyed by server name.
//!
//! Values are JSON-encoded [`ServerRecord`]s — the full user-visible config
//! plus the durable runtime fields (`ever_connected`,
//! `last_successful_connection`) that survive restarts but never appear in
//! the config file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::{RelayError, Result};
use crate::domain::server::ServerConfig;

const TREE_NAME: &str = "upstream_servers";

/// Durable record for one upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    #[serde(flatten)]
    pub config: ServerConfig,

    #[serde(default)]
    pub ever_connected: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_connection: Option<DateTime<Utc>>,
}

impl ServerRecord {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, ever_connected: false, last_successful_connection: None }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

pub struct RecordStore {
    _db: sled::Db,
    tree: sled::Tree,
}

impl RecordStore {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let db = sled::open(path).map_err(RelayError::persistence)?;
        let tree = db.open_tree(TREE_NAME).map_err(RelayError::persistence)?;
        Ok(Self { _db: db, tree })
    }

    pub fn get(&self, name: &str) -> Result<Option<ServerRecord>> {
        let Some(bytes) = self.tree.get(name.as_bytes()).map_err(RelayError::persistence)? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&bytes).map_err(RelayError::persistence)?;
        Ok(Some(record))
    }

    pub fn put(&self, record: &ServerRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record).map_err(RelayError::persistence)?;
        self.tree
            .insert(record.name().as_bytes(), bytes)
            .map_err(RelayError::persistence)?;
        self.tree.flush().map_err(RelayError::persistence)?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        self.tree.remove(name.as_bytes()).map_err(RelayError::persistence)?;
        self.tree.flush().map_err(RelayError::persistence)?;
        Ok(())
    }

    /// All records in key (name) order — sled iterates lexicographically, so
    /// config-file rewrites are deterministic.
    pub fn list(&self) -> Result<Vec<ServerRecord>> {
        let mut records = Vec::new();
        for item in self.tree.iter() {
            let (_, bytes) = item.map_err(RelayError::persistence)?;
            records.push(serde_json::from_slice(&bytes).map_err(RelayError::persistence)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(&dir.path().join("records.sled")).unwrap();

        let record = ServerRecord::new(ServerConfig::stdio("github", "gh-mcp", &[]));
        store.put(&record).unwrap();
        assert_eq!(store.get("github").unwrap().unwrap(), record);

        store.remove("github").unwrap();
        assert!(store.get("github").unwrap().is_none());
    }

    #[test]
    fn list_is_name_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(&dir.path().join("records.sled")).unwrap();
        for name in ["zeta", "alpha", "mid"] {
            store
                .put(&ServerRecord::new(ServerConfig::stdio(name, "cmd", &[])))
                .unwrap();
        }
        let names: Vec<_> = store.list().unwrap().into_iter().map(|r| r.config.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn record_json_never_contains_user_stopped() {
        let record = ServerRecord::new(ServerConfig::stdio("s", "cmd", &[]));
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("stopped"));
    }
}
