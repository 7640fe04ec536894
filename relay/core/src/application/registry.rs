// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Registry adapters behind the `search_servers` / `list_registries`
//! pass-throughs.
//!
//! Real registry integrations are external collaborators; the core only
//! defines the seam and ships an in-memory adapter so the facade operations
//! are exercisable end-to-end.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::error::{RelayError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_command: Option<String>,
}

#[async_trait]
pub trait RegistryAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RegistryEntry>>;
}

/// In-memory adapter over a fixed entry list.
pub struct StaticRegistry {
    name: String,
    entries: Vec<RegistryEntry>,
}

impl StaticRegistry {
    pub fn new(name: impl Into<String>, entries: Vec<RegistryEntry>) -> Self {
        Self { name: name.into(), entries }
    }
}

#[async_trait]
impl RegistryAdapter for StaticRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RegistryEntry>> {
        let query = query.to_lowercase();
        Ok(self
            .entries
            .iter()
            .filter(|e| {
                query.is_empty()
                    || e.name.to_lowercase().contains(&query)
                    || e.description.to_lowercase().contains(&query)
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

/// The set of configured adapters.
#[derive(Default)]
pub struct RegistrySet {
    adapters: Vec<Box<dyn RegistryAdapter>>,
}

impl RegistrySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Box<dyn RegistryAdapter>) {
        self.adapters.push(adapter);
    }

    pub fn list(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.name().to_string()).collect()
    }

    /// Search one registry by name, or all of them.
    pub async fn search(
        &self,
        registry: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(String, Vec<RegistryEntry>)>> {
        match registry {
            Some(name) => {
                let adapter = self
                    .adapters
                    .iter()
                    .find(|a| a.name() == name)
                    .ok_or_else(|| RelayError::NotFound(format!("registry '{name}'")))?;
                Ok(vec![(name.to_string(), adapter.search(query, limit).await?)])
            }
            None => {
                let mut out = Vec::new();
                for adapter in &self.adapters {
                    out.push((adapter.name().to_string(), adapter.search(query, limit).await?));
                }
                Ok(out)
            }
        }
    }
}
