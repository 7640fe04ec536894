// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Result cache backing the `read_cache` facade operation.
//!
//! Oversized tool results are truncated before being returned downstream;
//! the full text is chunked and parked here under an opaque id so the
//! client can page through the remainder.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::error::{RelayError, Result};

/// Default chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 16_000;
/// Entries older than this are dropped on the next insert.
const TTL: Duration = Duration::from_secs(30 * 60);

struct CachedResult {
    chunks: Vec<String>,
    created: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePage {
    pub cache_id: String,
    pub page: usize,
    pub total_pages: usize,
    pub content: String,
}

pub struct ResultCache {
    entries: DashMap<String, CachedResult>,
    chunk_size: usize,
}

impl ResultCache {
    pub fn new(chunk_size: usize) -> Self {
        Self { entries: DashMap::new(), chunk_size }
    }

    /// Store `text` if it exceeds one chunk. Returns the first page to hand
    /// back inline, or `None` when the text fits as-is.
    pub fn truncate_and_store(&self, text: &str) -> Option<CachePage> {
        if text.chars().count() <= self.chunk_size {
            return None;
        }
        self.evict_expired();

        let chunks: Vec<String> = text
            .chars()
            .collect::<Vec<char>>()
            .chunks(self.chunk_size)
            .map(|c| c.iter().collect())
            .collect();
        let total_pages = chunks.len();
        let first = chunks[0].clone();
        let id = Uuid::new_v4().to_string();
        self.entries.insert(id.clone(), CachedResult { chunks, created: Instant::now() });
        Some(CachePage { cache_id: id, page: 0, total_pages, content: first })
    }

    pub fn read(&self, id: &str, page: usize) -> Result<CachePage> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| RelayError::NotFound(format!("cache entry '{id}'")))?;
        let chunk = entry
            .chunks
            .get(page)
            .ok_or_else(|| {
                RelayError::invalid_input(format!(
                    "page {page} out of range (total {})",
                    entry.chunks.len()
                ))
            })?
            .clone();
        Ok(CachePage {
            cache_id: id.to_string(),
            page,
            total_pages: entry.chunks.len(),
            content: chunk,
        })
    }

    fn evict_expired(&self) {
        self.entries.retain(|_, entry| entry.created.elapsed() < TTL);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}
