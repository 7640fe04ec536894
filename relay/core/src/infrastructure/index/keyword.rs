// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Keyword index: BM25 over an in-memory inverted index.
//!
//! Documents are tool entries flattened to `server tool description params`;
//! keys are `server:tool`. Standard parameters k1 = 1.2, b = 0.75.

use std::collections::HashMap;

use crate::infrastructure::index::embed::tokenize;

const K1: f32 = 1.2;
const B: f32 = 0.75;

#[derive(Default)]
pub struct KeywordIndex {
    /// key → document length in tokens.
    docs: HashMap<String, usize>,
    /// term → (key → term frequency).
    postings: HashMap<String, HashMap<String, u32>>,
    total_tokens: usize,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn insert(&mut self, key: &str, text: &str) {
        self.remove(key);
        let mut length = 0usize;
        for token in tokenize(text) {
            length += 1;
            *self
                .postings
                .entry(token)
                .or_default()
                .entry(key.to_string())
                .or_insert(0) += 1;
        }
        self.docs.insert(key.to_string(), length);
        self.total_tokens += length;
    }

    pub fn remove(&mut self, key: &str) {
        let Some(length) = self.docs.remove(key) else { return };
        self.total_tokens -= length;
        self.postings.retain(|_, keys| {
            keys.remove(key);
            !keys.is_empty()
        });
    }

    /// Keys ranked by BM25 score, best first. Only documents matching at
    /// least one query term appear.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(String, f32)> {
        if self.docs.is_empty() {
            return Vec::new();
        }
        let doc_count = self.docs.len() as f32;
        let avg_len = self.total_tokens as f32 / doc_count;

        let mut scores: HashMap<&str, f32> = HashMap::new();
        for term in tokenize(query) {
            let Some(keys) = self.postings.get(&term) else { continue };
            let df = keys.len() as f32;
            let idf = ((doc_count - df + 0.5) / (df + 0.5) + 1.0).ln();
            for (key, tf) in keys {
                let doc_len = *self.docs.get(key).unwrap_or(&0) as f32;
                let tf = *tf as f32;
                let score =
                    idf * (tf * (K1 + 1.0)) / (tf + K1 * (1.0 - B + B * doc_len / avg_len.max(1.0)));
                *scores.entry(key.as_str()).or_insert(0.0) += score;
            }
        }

        let mut ranked: Vec<(String, f32)> =
            scores.into_iter().map(|(k, s)| (k.to_string(), s)).collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> KeywordIndex {
        let mut index = KeywordIndex::new();
        index.insert(
            "github:create_issue",
            "github create_issue Create a new issue in a GitHub repository to report a bug or request a feature",
        );
        index.insert(
            "jira:create_ticket",
            "jira create_ticket Create a ticket in a Jira project",
        );
        index.insert(
            "slack:send_message",
            "slack send_message Send a message to a Slack channel",
        );
        index
    }

    #[test]
    fn term_overlap_ranks_first() {
        let index = sample_index();
        let hits = index.search("file a bug on github", 10);
        assert_eq!(hits[0].0, "github:create_issue");
    }

    #[test]
    fn tool_name_tokens_match() {
        let index = sample_index();
        let hits = index.search("create_issue", 10);
        assert_eq!(hits[0].0, "github:create_issue");
    }

    #[test]
    fn non_matching_docs_are_absent() {
        let index = sample_index();
        let hits = index.search("slack message", 10);
        assert!(hits.iter().all(|(k, _)| k != "github:create_issue"));
    }

    #[test]
    fn remove_then_reinsert_is_clean() {
        let mut index = sample_index();
        index.remove("github:create_issue");
        assert!(index.search("github", 10).is_empty());
        assert_eq!(index.len(), 2);

        index.insert("github:create_issue", "github issue tracker");
        assert_eq!(index.search("tracker", 10)[0].0, "github:create_issue");
    }

    #[test]
    fn insert_is_idempotent_for_length_accounting() {
        let mut index = KeywordIndex::new();
        index.insert("a:b", "one two three");
        index.insert("a:b", "one two three");
        assert_eq!(index.len(), 1);
        assert_eq!(index.total_tokens, 3);
    }

    #[test]
    fn empty_query_returns_nothing() {
        let index = sample_index();
        assert!(index.search("!!", 10).is_empty());
    }
}
