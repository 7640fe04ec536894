// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Tool Index
//!
//! Two cooperating indices keyed by `server:tool`:
//!
//! - a **keyword** BM25 inverted index over `name + description + params`;
//! - an optional **semantic** index of normalized embedding vectors.
//!
//! Hybrid search fuses both rankings with Reciprocal Rank Fusion:
//! `score = w/(60 + rank_sem) + (1-w)/(60 + rank_bm25)`.
//!
//! Entries for a server are removed on disconnect and rebuilt on the next
//! Ready; quarantined servers are additionally filtered at query time, so a
//! quarantined upstream's tools are invisible to `retrieve_tools` even while
//! its metadata is still inspectable through the admin surface.

pub mod embed;
pub mod keyword;
pub mod semantic;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::error::Result;
use crate::domain::tool::ToolEntry;
use embed::Embedder;
use keyword::KeywordIndex;
use semantic::SemanticIndex;

/// RRF rank-smoothing constant.
const RRF_K: f32 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Keyword,
    Semantic,
    Hybrid,
}

impl Default for SearchMode {
    fn default() -> Self {
        Self::Hybrid
    }
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "keyword" => Ok(Self::Keyword),
            "semantic" => Ok(Self::Semantic),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown search mode '{other}'")),
        }
    }
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub server_name: String,
    pub tool_name: String,
    pub description: String,
    pub params_json: String,
    pub score: f32,
    /// 1-based ranks in the individual backends, for `debug` mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_rank: Option<usize>,
}

impl SearchHit {
    pub fn key(&self) -> String {
        format!("{}:{}", self.server_name, self.tool_name)
    }
}

pub struct ToolIndex {
    entries: RwLock<HashMap<String, ToolEntry>>,
    keyword: RwLock<KeywordIndex>,
    semantic: Option<SemanticIndex>,
    /// Servers whose entries are hidden from search results.
    quarantined: RwLock<HashSet<String>>,
    default_weight: f32,
    min_similarity: f32,
}

impl ToolIndex {
    pub fn new(
        semantic_embedder: Option<Arc<dyn Embedder>>,
        sidecar_path: Option<PathBuf>,
        default_weight: f32,
        min_similarity: f32,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            keyword: RwLock::new(KeywordIndex::new()),
            semantic: semantic_embedder.map(|e| SemanticIndex::new(e, sidecar_path)),
            quarantined: RwLock::new(HashSet::new()),
            default_weight,
            min_similarity,
        }
    }

    /// Keyword-only index with defaults; the common test entry point.
    pub fn keyword_only() -> Self {
        Self::new(None, None, 0.5, 0.0)
    }

    fn document_text(entry: &ToolEntry) -> String {
        format!(
            "{} {} {} {}",
            entry.server_name, entry.tool_name, entry.description, entry.params_json
        )
    }

    pub async fn index_tool(&self, entry: ToolEntry) -> Result<()> {
        let key = entry.key();
        self.keyword.write().insert(&key, &Self::document_text(&entry));
        if let Some(semantic) = &self.semantic {
            semantic
                .insert(
                    &key,
                    &entry.server_name,
                    &entry.tool_name,
                    &entry.hash,
                    &Self::document_text(&entry),
                )
                .await?;
        }
        self.entries.write().insert(key, entry);
        Ok(())
    }

    pub async fn batch_index(&self, entries: Vec<ToolEntry>) -> Result<usize> {
        let count = entries.len();
        for entry in entries {
            self.index_tool(entry).await?;
        }
        Ok(count)
    }

    pub fn delete_tool(&self, server: &str, tool: &str) {
        let key = format!("{server}:{tool}");
        self.entries.write().remove(&key);
        self.keyword.write().remove(&key);
        if let Some(semantic) = &self.semantic {
            semantic.remove(&key);
        }
    }

    /// Invalidation on disconnect: every entry for `server` goes away.
    pub fn delete_server_tools(&self, server: &str) {
        let keys: Vec<String> = {
            let entries = self.entries.read();
            entries
                .values()
                .filter(|e| e.server_name == server)
                .map(|e| e.key())
                .collect()
        };
        let mut entries = self.entries.write();
        let mut keyword = self.keyword.write();
        for key in &keys {
            entries.remove(key);
            keyword.remove(key);
        }
        drop(keyword);
        drop(entries);
        if let Some(semantic) = &self.semantic {
            semantic.remove_server(server);
        }
        if !keys.is_empty() {
            debug!(server, removed = keys.len(), "tool index invalidated");
        }
    }

    pub fn set_quarantined(&self, server: &str, quarantined: bool) {
        let mut set = self.quarantined.write();
        if quarantined {
            set.insert(server.to_string());
        } else {
            set.remove(server);
        }
    }

    pub fn set_connected(&self, server: &str, connected: bool) {
        let mut entries = self.entries.write();
        for entry in entries.values_mut() {
            if entry.server_name == server {
                entry.server_connected = connected;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn entries_for(&self, server: &str) -> Vec<ToolEntry> {
        self.entries
            .read()
            .values()
            .filter(|e| e.server_name == server)
            .cloned()
            .collect()
    }

    /// Ranked search. `weight` and `min_similarity` fall back to the
    /// configured defaults when `None`.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        mode: SearchMode,
        weight: Option<f32>,
        min_similarity: Option<f32>,
    ) -> Result<Vec<SearchHit>> {
        let weight = weight.unwrap_or(self.default_weight).clamp(0.0, 1.0);
        let min_similarity = min_similarity.unwrap_or(self.min_similarity);
        // Over-fetch each backend so fusion has material to reorder.
        let backend_limit = (limit * 4).max(20);

        let effective_mode = match (&self.semantic, mode) {
            (None, SearchMode::Semantic) | (None, SearchMode::Hybrid) => SearchMode::Keyword,
            (_, mode) => mode,
        };

        let keyword_ranked = match effective_mode {
            SearchMode::Semantic => Vec::new(),
            _ => self.keyword.read().search(query, backend_limit),
        };
        let semantic_ranked = match (effective_mode, &self.semantic) {
            (SearchMode::Keyword, _) | (_, None) => Vec::new(),
            (_, Some(semantic)) => semantic.search(query, backend_limit, min_similarity).await?,
        };

        let keyword_ranks: HashMap<&str, usize> = keyword_ranked
            .iter()
            .enumerate()
            .map(|(i, (k, _))| (k.as_str(), i + 1))
            .collect();
        let semantic_ranks: HashMap<&str, usize> = semantic_ranked
            .iter()
            .enumerate()
            .map(|(i, (k, _))| (k.as_str(), i + 1))
            .collect();

        let mut fused: HashMap<String, f32> = HashMap::new();
        match effective_mode {
            SearchMode::Keyword => {
                for (key, rank) in &keyword_ranks {
                    fused.insert(key.to_string(), 1.0 / (RRF_K + *rank as f32));
                }
            }
            SearchMode::Semantic => {
                for (key, rank) in &semantic_ranks {
                    fused.insert(key.to_string(), 1.0 / (RRF_K + *rank as f32));
                }
            }
            SearchMode::Hybrid => {
                for (key, rank) in &semantic_ranks {
                    *fused.entry(key.to_string()).or_insert(0.0) +=
                        weight / (RRF_K + *rank as f32);
                }
                for (key, rank) in &keyword_ranks {
                    *fused.entry(key.to_string()).or_insert(0.0) +=
                        (1.0 - weight) / (RRF_K + *rank as f32);
                }
                // Degenerate weights reduce exactly to the single backend.
                if weight == 0.0 {
                    fused.retain(|key, _| keyword_ranks.contains_key(key.as_str()));
                } else if weight == 1.0 {
                    fused.retain(|key, _| semantic_ranks.contains_key(key.as_str()));
                }
            }
        }

        let entries = self.entries.read();
        let quarantined = self.quarantined.read();
        let mut hits: Vec<SearchHit> = fused
            .into_iter()
            .filter_map(|(key, score)| {
                let entry = entries.get(&key)?;
                if quarantined.contains(&entry.server_name) {
                    return None;
                }
                Some(SearchHit {
                    server_name: entry.server_name.clone(),
                    tool_name: entry.tool_name.clone(),
                    description: entry.description.clone(),
                    params_json: entry.params_json.clone(),
                    score,
                    keyword_rank: keyword_ranks.get(key.as_str()).copied(),
                    semantic_rank: semantic_ranks.get(key.as_str()).copied(),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key().cmp(&b.key()))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embed::HashEmbedder;

    async fn sample_index(with_semantic: bool) -> ToolIndex {
        let index = if with_semantic {
            ToolIndex::new(Some(Arc::new(HashEmbedder::new())), None, 0.5, 0.0)
        } else {
            ToolIndex::keyword_only()
        };
        index
            .batch_index(vec![
                ToolEntry::new(
                    "github",
                    "create_issue",
                    "Create a new issue in a GitHub repository to report a bug or request a feature",
                    r#"{"type":"object","properties":{"title":{"type":"string"}}}"#,
                ),
                ToolEntry::new(
                    "jira",
                    "create_ticket",
                    "Create a ticket in a Jira project",
                    r#"{"type":"object","properties":{"summary":{"type":"string"}}}"#,
                ),
                ToolEntry::new(
                    "slack",
                    "send_message",
                    "Send a message to a Slack channel",
                    r#"{"type":"object","properties":{"text":{"type":"string"}}}"#,
                ),
            ])
            .await
            .unwrap();
        index
    }

    #[tokio::test]
    async fn hybrid_ranks_github_first_for_bug_query() {
        let index = sample_index(true).await;
        let hits = index
            .search("file a bug on github", 10, SearchMode::Hybrid, Some(0.5), None)
            .await
            .unwrap();
        assert_eq!(hits[0].key(), "github:create_issue");
    }

    #[tokio::test]
    async fn weight_zero_equals_keyword_only() {
        let index = sample_index(true).await;
        let hybrid = index
            .search("create_issue", 10, SearchMode::Hybrid, Some(0.0), None)
            .await
            .unwrap();
        let keyword = index
            .search("create_issue", 10, SearchMode::Keyword, None, None)
            .await
            .unwrap();
        let hybrid_keys: Vec<String> = hybrid.iter().map(|h| h.key()).collect();
        let keyword_keys: Vec<String> = keyword.iter().map(|h| h.key()).collect();
        assert_eq!(hybrid_keys, keyword_keys);
        assert_eq!(hybrid_keys[0], "github:create_issue");
    }

    #[tokio::test]
    async fn weight_one_equals_semantic_only() {
        let index = sample_index(true).await;
        let hybrid = index
            .search("make a bug report", 10, SearchMode::Hybrid, Some(1.0), None)
            .await
            .unwrap();
        let semantic = index
            .search("make a bug report", 10, SearchMode::Semantic, None, None)
            .await
            .unwrap();
        let hybrid_keys: Vec<String> = hybrid.iter().map(|h| h.key()).collect();
        let semantic_keys: Vec<String> = semantic.iter().map(|h| h.key()).collect();
        assert_eq!(hybrid_keys, semantic_keys);
        // Semantic ranking keeps the issue tool in the top two.
        let position = hybrid_keys.iter().position(|k| k == "github:create_issue");
        assert!(matches!(position, Some(0) | Some(1)));
    }

    #[tokio::test]
    async fn hybrid_is_subset_of_backend_union() {
        let index = sample_index(true).await;
        let hybrid = index
            .search("create something", 10, SearchMode::Hybrid, Some(0.3), None)
            .await
            .unwrap();
        let keyword = index
            .search("create something", 10, SearchMode::Keyword, None, None)
            .await
            .unwrap();
        let semantic = index
            .search("create something", 10, SearchMode::Semantic, None, None)
            .await
            .unwrap();
        let union: HashSet<String> = keyword
            .iter()
            .chain(semantic.iter())
            .map(|h| h.key())
            .collect();
        assert!(hybrid.iter().all(|h| union.contains(&h.key())));
    }

    #[tokio::test]
    async fn quarantined_server_is_invisible() {
        let index = sample_index(false).await;
        index.set_quarantined("github", true);
        let hits = index
            .search("github issue", 10, SearchMode::Keyword, None, None)
            .await
            .unwrap();
        assert!(hits.iter().all(|h| h.server_name != "github"));

        index.set_quarantined("github", false);
        let hits = index
            .search("github issue", 10, SearchMode::Keyword, None, None)
            .await
            .unwrap();
        assert_eq!(hits[0].server_name, "github");
    }

    #[tokio::test]
    async fn delete_server_tools_invalidates() {
        let index = sample_index(false).await;
        index.delete_server_tools("github");
        assert_eq!(index.len(), 2);
        let hits = index
            .search("github", 10, SearchMode::Keyword, None, None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn index_then_delete_restores_prior_state() {
        let index = sample_index(false).await;
        let before = index.len();
        let entry = ToolEntry::new("temp", "tool", "Temporary tool", "{}");
        index.index_tool(entry).await.unwrap();
        index.delete_tool("temp", "tool");
        assert_eq!(index.len(), before);
        let hits = index
            .search("temporary", 10, SearchMode::Keyword, None, None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn semantic_mode_without_embedder_falls_back_to_keyword() {
        let index = sample_index(false).await;
        let hits = index
            .search("github issue", 10, SearchMode::Semantic, None, None)
            .await
            .unwrap();
        assert_eq!(hits[0].server_name, "github");
    }
}
