// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Embedding providers for the semantic tool index.
//!
//! Two implementations behind one seam: an OpenAI-compatible HTTP client for
//! real deployments, and a deterministic token-projection embedder used when
//! no endpoint is configured (and by tests — it needs no network and always
//! produces the same vector for the same text).

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::domain::error::{RelayError, Result};

/// Dimensionality of the fallback embedder (matches all-MiniLM-L6-v2 so a
/// sidecar produced with the fallback stays size-compatible).
pub const HASH_EMBED_DIMS: usize = 384;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Stable identifier recorded in the sidecar, so vectors from a
    /// different provider are never compared against each other.
    fn id(&self) -> String;
}

/// Deterministic bag-of-tokens projection.
///
/// Each token is hashed onto a pseudo-random unit direction; the document
/// vector is the normalized sum. Token overlap between query and document
/// then shows up as cosine similarity, which is all the offline fallback
/// needs.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self { dims: HASH_EMBED_DIMS }
    }

    fn token_direction(&self, token: &str) -> Vec<f32> {
        let digest = Sha256::digest(token.as_bytes());
        let mut seed = u64::from_le_bytes(digest[..8].try_into().expect("8 bytes"));
        let mut direction = Vec::with_capacity(self.dims);
        for _ in 0..self.dims {
            // xorshift64*
            seed ^= seed >> 12;
            seed ^= seed << 25;
            seed ^= seed >> 27;
            let value = seed.wrapping_mul(0x2545F4914F6CDD1D);
            direction.push(((value >> 11) as f32 / (1u64 << 53) as f32) * 2.0 - 1.0);
        }
        direction
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut sum = vec![0.0f32; self.dims];
        let mut tokens = 0usize;
        for token in tokenize(text) {
            tokens += 1;
            for (slot, component) in sum.iter_mut().zip(self.token_direction(&token)) {
                *slot += component;
            }
        }
        if tokens == 0 {
            return Ok(sum);
        }
        Ok(normalize(sum))
    }

    fn id(&self) -> String {
        format!("hash-projection-{}", self.dims)
    }
}

/// OpenAI-compatible `/embeddings` client.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingsDatum>,
}

#[derive(Deserialize)]
struct EmbeddingsDatum {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build().map_err(RelayError::transport)?,
            endpoint: endpoint.into(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "model": self.model, "input": [text] }))
            .send()
            .await
            .map_err(RelayError::transport)?;
        if !response.status().is_success() {
            return Err(RelayError::Transport(format!(
                "embedding endpoint returned HTTP {}",
                response.status()
            )));
        }
        let mut parsed: EmbeddingsResponse =
            response.json().await.map_err(RelayError::transport)?;
        if parsed.data.is_empty() {
            return Err(RelayError::Transport("embedding endpoint returned no data".into()));
        }
        Ok(normalize(parsed.data.remove(0).embedding))
    }

    fn id(&self) -> String {
        format!("openai-compatible:{}", self.model)
    }
}

/// Shared tokenizer for the keyword index and the fallback embedder:
/// lowercase alphanumeric runs, two characters or longer.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_lowercase())
}

pub fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    // Vectors are stored normalized; cosine reduces to the dot product.
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new();
        let a = embedder.embed("create a github issue").await.unwrap();
        let b = embedder.embed("create a github issue").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn token_overlap_drives_similarity() {
        let embedder = HashEmbedder::new();
        let issue = embedder.embed("create issue bug report github").await.unwrap();
        let ticket = embedder.embed("create ticket jira project").await.unwrap();
        let query = embedder.embed("make a bug report").await.unwrap();

        assert!(cosine(&query, &issue) > cosine(&query, &ticket));
    }

    #[tokio::test]
    async fn empty_text_embeds_to_zero() {
        let embedder = HashEmbedder::new();
        let zero = embedder.embed("  !! ").await.unwrap();
        assert!(zero.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn tokenizer_splits_snake_case_and_drops_noise() {
        let tokens: Vec<String> = tokenize("create_issue: a GitHub API-v3 call").collect();
        assert_eq!(tokens, vec!["create", "issue", "github", "api", "v3", "call"]);
    }
}
