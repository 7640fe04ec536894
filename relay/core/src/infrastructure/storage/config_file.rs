// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Config-file surface: the user-facing JSON document.
//!
//! Writes go through a temp file in the same directory followed by an atomic
//! rename, so a crash mid-write never leaves a torn config. Reads of a
//! missing file yield the default config (first-run).

use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::config::RelayConfig;
use crate::domain::error::{RelayError, Result};

pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn read(&self) -> Result<RelayConfig> {
        if !self.path.exists() {
            return Ok(RelayConfig::default());
        }
        let bytes = fs::read(&self.path).map_err(RelayError::persistence)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RelayError::persistence(format!("config parse: {e}")))
    }

    pub fn write(&self, config: &RelayConfig) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(config).map_err(RelayError::persistence)?;
        let dir = self
            .path
            .parent()
            .ok_or_else(|| RelayError::persistence("config path has no parent directory"))?;
        fs::create_dir_all(dir).map_err(RelayError::persistence)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).map_err(RelayError::persistence)?;
        fs::rename(&tmp, &self.path).map_err(RelayError::persistence)?;
        Ok(())
    }

    /// Raw bytes, for tests asserting byte-level agreement and neutrality.
    pub fn raw_bytes(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).map_err(RelayError::persistence)
    }
}
