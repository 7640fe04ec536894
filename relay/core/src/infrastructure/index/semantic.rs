// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Semantic index: normalized embedding vectors with cosine ranking,
//! persisted to a JSON sidecar (`server:tool` → embedding + metadata).
//!
//! The sidecar is advisory: entries whose provider id does not match the
//! active embedder are discarded on load and rebuilt on the next discovery.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::error::{RelayError, Result};
use crate::infrastructure::index::embed::{cosine, Embedder};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarEntry {
    pub embedding: Vec<f32>,
    pub metadata: SidecarMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarMetadata {
    pub server: String,
    pub tool: String,
    pub hash: String,
    pub provider: String,
}

#[derive(Default, Serialize, Deserialize)]
struct Sidecar {
    entries: HashMap<String, SidecarEntry>,
}

pub struct SemanticIndex {
    embedder: Arc<dyn Embedder>,
    vectors: RwLock<HashMap<String, SidecarEntry>>,
    sidecar_path: Option<PathBuf>,
}

impl SemanticIndex {
    pub fn new(embedder: Arc<dyn Embedder>, sidecar_path: Option<PathBuf>) -> Self {
        let index = Self {
            embedder,
            vectors: RwLock::new(HashMap::new()),
            sidecar_path,
        };
        if let Err(err) = index.load_sidecar() {
            warn!(%err, "semantic sidecar unreadable; starting empty");
        }
        index
    }

    fn load_sidecar(&self) -> Result<()> {
        let Some(path) = &self.sidecar_path else { return Ok(()) };
        if !path.exists() {
            return Ok(());
        }
        let bytes = std::fs::read(path).map_err(RelayError::persistence)?;
        let sidecar: Sidecar = serde_json::from_slice(&bytes).map_err(RelayError::persistence)?;
        let provider = self.embedder.id();
        let mut vectors = self.vectors.write();
        for (key, entry) in sidecar.entries {
            if entry.metadata.provider == provider {
                vectors.insert(key, entry);
            }
        }
        debug!(entries = vectors.len(), "semantic sidecar loaded");
        Ok(())
    }

    fn persist_sidecar(&self) {
        let Some(path) = &self.sidecar_path else { return };
        let sidecar = Sidecar { entries: self.vectors.read().clone() };
        let result = serde_json::to_vec_pretty(&sidecar)
            .map_err(RelayError::persistence)
            .and_then(|bytes| std::fs::write(path, bytes).map_err(RelayError::persistence));
        if let Err(err) = result {
            warn!(%err, "failed to persist semantic sidecar");
        }
    }

    pub async fn insert(&self, key: &str, server: &str, tool: &str, hash: &str, text: &str) -> Result<()> {
        // Unchanged fingerprint ⇒ the existing vector is still valid.
        if let Some(existing) = self.vectors.read().get(key) {
            if existing.metadata.hash == hash {
                return Ok(());
            }
        }
        let embedding = self.embedder.embed(text).await?;
        self.vectors.write().insert(
            key.to_string(),
            SidecarEntry {
                embedding,
                metadata: SidecarMetadata {
                    server: server.to_string(),
                    tool: tool.to_string(),
                    hash: hash.to_string(),
                    provider: self.embedder.id(),
                },
            },
        );
        self.persist_sidecar();
        Ok(())
    }

    pub fn remove(&self, key: &str) {
        if self.vectors.write().remove(key).is_some() {
            self.persist_sidecar();
        }
    }

    pub fn remove_server(&self, server: &str) {
        let mut vectors = self.vectors.write();
        let before = vectors.len();
        vectors.retain(|_, entry| entry.metadata.server != server);
        let changed = vectors.len() != before;
        drop(vectors);
        if changed {
            self.persist_sidecar();
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.read().is_empty()
    }

    /// Keys ranked by cosine similarity, best first, floored at
    /// `min_similarity`.
    pub async fn search(&self, query: &str, limit: usize, min_similarity: f32) -> Result<Vec<(String, f32)>> {
        let query_vector = self.embedder.embed(query).await?;
        let vectors = self.vectors.read();
        let mut ranked: Vec<(String, f32)> = vectors
            .iter()
            .map(|(key, entry)| (key.clone(), cosine(&query_vector, &entry.embedding)))
            .filter(|(_, score)| *score >= min_similarity)
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        Ok(ranked)
    }
}
