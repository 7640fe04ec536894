// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Relay Configuration Types
//
// Defines the schema of the user-facing config file: a top-level `mcpServers`
// array of upstream configs plus global options. The config file is the
// source of truth for configuration fields; the record store mirrors it and
// adds durable runtime fields. Reconciliation rules live in the storage
// layer, not here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::domain::server::ServerConfig;

fn default_listen() -> String {
    "127.0.0.1:8091".to_string()
}

fn default_max_concurrent_connections() -> usize {
    15
}

fn default_call_tool_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_tools_limit() -> usize {
    15
}

fn default_true() -> bool {
    true
}

fn default_health_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_hybrid_weight() -> f32 {
    0.5
}

/// Semantic-search options. When disabled (or no endpoint is configured and
/// the deterministic fallback is off), `retrieve_tools` is keyword-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticSearchConfig {
    #[serde(default)]
    pub enabled: bool,

    /// OpenAI-compatible `/embeddings` endpoint. Absent ⇒ the deterministic
    /// token-projection embedder is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// RRF weight `w` given to the semantic ranking (`1 - w` to keyword).
    #[serde(default = "default_hybrid_weight")]
    pub weight: f32,

    /// Cosine-similarity floor below which semantic hits are discarded.
    #[serde(default)]
    pub min_similarity: f32,
}

impl Default for SemanticSearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            model: None,
            weight: default_hybrid_weight(),
            min_similarity: 0.0,
        }
    }
}

/// Top-level relay configuration (the config file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: Vec<ServerConfig>,

    /// Bind address for the HTTP/WebSocket surface.
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_connections: usize,

    #[serde(default = "default_call_tool_timeout", with = "humantime_serde")]
    pub call_tool_timeout: Duration,

    /// Default result cap for `retrieve_tools`.
    #[serde(default = "default_tools_limit")]
    pub tools_limit: usize,

    #[serde(default)]
    pub semantic_search: SemanticSearchConfig,

    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Functional `tools/list` probe tick. Kept well above the health tick to
    /// bound probe overhead.
    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub probe_interval: Duration,

    /// User-defined server groups for bulk state control. BTreeMap keeps the
    /// file layout stable across rewrites.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, Vec<String>>,

    /// Serve the downstream MCP endpoint on stdio.
    #[serde(default = "default_true")]
    pub serve_stdio: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mcp_servers: Vec::new(),
            listen: default_listen(),
            max_concurrent_connections: default_max_concurrent_connections(),
            call_tool_timeout: default_call_tool_timeout(),
            tools_limit: default_tools_limit(),
            semantic_search: SemanticSearchConfig::default(),
            health_check_interval: default_health_interval(),
            probe_interval: default_probe_interval(),
            groups: BTreeMap::new(),
            serve_stdio: true,
        }
    }
}

impl RelayConfig {
    /// Validate global options and every server entry; duplicate names are a
    /// hard error because the registry is keyed by name.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_concurrent_connections == 0 {
            return Err("maxConcurrentConnections must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.semantic_search.weight) {
            return Err("semanticSearch.weight must be within [0, 1]".into());
        }
        let mut seen = std::collections::HashSet::new();
        for server in &self.mcp_servers {
            server.validate()?;
            if !seen.insert(server.name.as_str()) {
                return Err(format!("duplicate server name '{}'", server.name));
            }
        }
        for (group, members) in &self.groups {
            for member in members {
                if !seen.contains(member.as_str()) {
                    return Err(format!(
                        "group '{group}' references unknown server '{member}'"
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.mcp_servers.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::server::Protocol;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: RelayConfig = serde_json::from_str(r#"{ "mcpServers": [] }"#).unwrap();
        assert_eq!(cfg.max_concurrent_connections, 15);
        assert_eq!(cfg.call_tool_timeout, Duration::from_secs(60));
        assert_eq!(cfg.tools_limit, 15);
        assert!(cfg.serve_stdio);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn humantime_durations_round_trip() {
        let cfg: RelayConfig = serde_json::from_str(
            r#"{ "mcpServers": [], "callToolTimeout": "90s", "healthCheckInterval": "2s" }"#,
        )
        .unwrap();
        assert_eq!(cfg.call_tool_timeout, Duration::from_secs(90));
        assert_eq!(cfg.health_check_interval, Duration::from_secs(2));
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut cfg = RelayConfig::default();
        cfg.mcp_servers.push(ServerConfig::stdio("a", "echo", &[]));
        cfg.mcp_servers.push(ServerConfig::stdio("a", "cat", &[]));
        assert!(cfg.validate().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn group_members_must_exist() {
        let mut cfg = RelayConfig::default();
        cfg.mcp_servers
            .push(ServerConfig::network("n", Protocol::Http, "http://localhost:9"));
        cfg.groups.insert("dev".into(), vec!["missing".into()]);
        assert!(cfg.validate().unwrap_err().contains("unknown server"));
    }

    #[test]
    fn weight_bounds_enforced() {
        let mut cfg = RelayConfig::default();
        cfg.semantic_search.weight = 1.5;
        assert!(cfg.validate().is_err());
    }
}
