// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Storage Layer
//!
//! Two persistent surfaces that must always agree:
//!
//! - the **record store** (sled, [`records`]) — server records including the
//!   durable runtime fields (`ever_connected`, `last_successful_connection`);
//! - the **config file** ([`config_file`]) — the user-facing source of truth
//!   for configuration fields.
//!
//! Every server mutation goes through the two-phase protocol:
//!
//! 1. snapshot the current record (for rollback),
//! 2. write the record store,
//! 3. rewrite the config file,
//! 4. on (3) failing: restore the snapshot and return a compound
//!    `persistence_failure`; on success publish `ServerConfigChanged`.
//!
//! A failed rollback is an invariant violation and aborts the process.
//!
//! On load the config file is authoritative: servers it enumerates are
//! inserted into the store, store entries absent from it are removed, and
//! legacy boolean lifecycle flags are migrated to the canonical
//! `startup_mode` enum (the legacy runtime `stopped` flag is always
//! discarded).

pub mod config_file;
pub mod records;

use std::path::Path;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::domain::config::RelayConfig;
use crate::domain::error::{RelayError, Result};
use crate::domain::events::{ConfigAction, EventPayload};
use crate::domain::server::{ServerConfig, StartupMode};
use crate::infrastructure::event_bus::EventBus;

pub use config_file::ConfigFile;
pub use records::{RecordStore, ServerRecord};

pub struct Storage {
    records: RecordStore,
    config_file: ConfigFile,
    bus: EventBus,
    /// Global options + groups (everything in the config file except the
    /// server array, which is derived from the record store).
    options: Mutex<RelayConfig>,
    /// Serializes two-phase writes.
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open both surfaces and reconcile them.
    pub fn open(data_dir: &Path, config_path: &Path, bus: EventBus) -> Result<Self> {
        let records = RecordStore::open(&data_dir.join("records.sled"))?;
        let config_file = ConfigFile::new(config_path);

        let mut config = config_file.read()?;
        for server in &mut config.mcp_servers {
            server.migrate_legacy_flags();
        }
        config.validate().map_err(RelayError::InvalidInput)?;

        let storage = Self {
            records,
            config_file,
            bus,
            options: Mutex::new(config.clone()),
            write_lock: Mutex::new(()),
        };
        storage.reconcile(&config)?;
        Ok(storage)
    }

    /// Bring the record store in line with the (authoritative) config file,
    /// then canonicalize the file itself.
    fn reconcile(&self, config: &RelayConfig) -> Result<()> {
        let known: std::collections::HashSet<&str> =
            config.mcp_servers.iter().map(|s| s.name.as_str()).collect();

        for record in self.records.list()? {
            if !known.contains(record.name()) {
                info!(server = record.name(), "removing record absent from config file");
                self.records.remove(record.name())?;
            }
        }

        for server in &config.mcp_servers {
            match self.records.get(&server.name)? {
                Some(mut record) => {
                    if record.config != *server {
                        record.config = server.clone();
                        self.records.put(&record)?;
                    }
                }
                None => {
                    debug!(server = %server.name, "inserting config-file server into record store");
                    self.records.put(&ServerRecord::new(server.clone()))?;
                }
            }
        }

        // Canonicalize: migrated flags and field-name skew are written back
        // exactly once, at load.
        self.sync_config_file()
    }

    /// Snapshot of the full config: global options plus the server array as
    /// the record store knows it.
    pub fn config(&self) -> RelayConfig {
        let mut config = self.options.lock().clone();
        if let Ok(records) = self.records.list() {
            config.mcp_servers = records.into_iter().map(|r| r.config).collect();
        }
        config
    }

    pub fn list_servers(&self) -> Result<Vec<ServerRecord>> {
        self.records.list()
    }

    pub fn get_server(&self, name: &str) -> Result<Option<ServerRecord>> {
        self.records.get(name)
    }

    /// Insert or update a server. Idempotent: an identical config is a no-op
    /// and publishes nothing. Durable runtime fields of an existing record
    /// are preserved.
    pub fn save_server(&self, mut config: ServerConfig) -> Result<Option<ConfigAction>> {
        config.migrate_legacy_flags();
        config.validate().map_err(RelayError::InvalidInput)?;

        let _guard = self.write_lock.lock();
        let existing = self.records.get(&config.name)?;
        let (record, action) = match existing {
            Some(prev) if prev.config == config => return Ok(None),
            Some(mut prev) => {
                prev.config = config;
                (prev, ConfigAction::Updated)
            }
            None => (ServerRecord::new(config), ConfigAction::Created),
        };
        let name = record.name().to_string();
        self.commit_server_change(&name, Some(record), action)?;
        Ok(Some(action))
    }

    pub fn delete_server(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.records.get(name)?.is_none() {
            return Err(RelayError::NotFound(name.to_string()));
        }
        self.commit_server_change(name, None, ConfigAction::Deleted)
    }

    pub fn enable_server(&self, name: &str, enabled: bool) -> Result<()> {
        self.mutate_server(name, |config| {
            if enabled {
                config.startup_mode = StartupMode::Active;
                config.auto_disable_reason = None;
            } else {
                config.startup_mode = StartupMode::Disabled;
            }
        })
    }

    pub fn set_startup_mode(
        &self,
        name: &str,
        mode: StartupMode,
        reason: Option<String>,
    ) -> Result<()> {
        self.mutate_server(name, |config| {
            config.startup_mode = mode;
            config.auto_disable_reason = match mode {
                StartupMode::AutoDisabled => reason.clone(),
                _ => None,
            };
        })
    }

    pub fn clear_auto_disable(&self, name: &str) -> Result<()> {
        self.mutate_server(name, |config| {
            if config.startup_mode == StartupMode::AutoDisabled {
                config.startup_mode = StartupMode::Active;
            }
            config.auto_disable_reason = None;
        })
    }

    fn mutate_server(&self, name: &str, f: impl Fn(&mut ServerConfig)) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut record = self
            .records
            .get(name)?
            .ok_or_else(|| RelayError::NotFound(name.to_string()))?;
        let before = record.config.clone();
        f(&mut record.config);
        if record.config == before {
            return Ok(());
        }
        self.commit_server_change(name, Some(record), ConfigAction::Updated)
    }

    /// Durable-runtime-field update. Record store only — the config file
    /// carries none of these fields, so its bytes are untouched and no
    /// `ServerConfigChanged` is published.
    pub fn record_connection_success(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let Some(mut record) = self.records.get(name)? else {
            return Ok(());
        };
        record.ever_connected = true;
        record.last_successful_connection = Some(chrono::Utc::now());
        self.records.put(&record)
    }

    /// Replace (or with `None`, remove) a user-defined group. Groups live
    /// only in the config file; the record store is not involved.
    pub fn set_group(&self, group: &str, servers: Option<Vec<String>>) -> Result<()> {
        let _guard = self.write_lock.lock();
        {
            let mut options = self.options.lock();
            match &servers {
                Some(list) => {
                    options.groups.insert(group.to_string(), list.clone());
                }
                None => {
                    options.groups.remove(group);
                }
            }
        }
        self.sync_config_file()?;
        self.bus.publish(EventPayload::ServerGroupUpdated {
            group: group.to_string(),
            servers: servers.unwrap_or_default(),
        });
        Ok(())
    }

    pub fn groups(&self) -> std::collections::BTreeMap<String, Vec<String>> {
        self.options.lock().groups.clone()
    }

    fn commit_server_change(
        &self,
        name: &str,
        new: Option<ServerRecord>,
        action: ConfigAction,
    ) -> Result<()> {
        let snapshot = self.records.get(name)?;

        match &new {
            Some(record) => self.records.put(record)?,
            None => self.records.remove(name)?,
        }

        if let Err(write_err) = self.sync_config_file() {
            let rollback = match &snapshot {
                Some(prev) => self.records.put(prev),
                None => self.records.remove(name),
            };
            if let Err(rollback_err) = rollback {
                error!(
                    server = name,
                    %write_err,
                    %rollback_err,
                    "config write failed and record-store rollback failed; state may have diverged"
                );
                std::process::abort();
            }
            return Err(RelayError::Persistence(format!(
                "config file write failed ({write_err}); record store rolled back"
            )));
        }

        self.bus.publish(EventPayload::ServerConfigChanged {
            server_name: name.to_string(),
            action,
        });
        Ok(())
    }

    fn sync_config_file(&self) -> Result<()> {
        let mut config = self.options.lock().clone();
        config.mcp_servers = self.records.list()?.into_iter().map(|r| r.config).collect();
        self.config_file.write(&config)
    }

    /// Raw config-file bytes, for byte-agreement assertions.
    pub fn config_file_bytes(&self) -> Result<Vec<u8>> {
        self.config_file.raw_bytes()
    }
}
