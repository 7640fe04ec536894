// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # MCP Facade Use-Cases
//!
//! The application-level implementation of the downstream meta-tool surface:
//! `retrieve_tools`, `call_tool`, `upstream_servers`, `quarantine_security`,
//! `groups`, the registry pass-throughs and `read_cache`.
//!
//! Every operation validates its inputs, delegates to the manager / index /
//! storage, and returns a JSON value ready for the MCP presentation layer.
//! Errors are [`RelayError`]s; the presentation layer maps their kinds onto
//! structured MCP error responses.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::application::cache::ResultCache;
use crate::application::registry::RegistrySet;
use crate::domain::error::{RelayError, Result};
use crate::domain::server::{ServerConfig, StartupMode};
use crate::domain::tool::parse_tool_ref;
use crate::infrastructure::index::SearchMode;
use crate::infrastructure::manager::UpstreamManager;

pub struct RelayFacade {
    manager: Arc<UpstreamManager>,
    cache: ResultCache,
    registries: RegistrySet,
    tools_limit: usize,
}

#[derive(Deserialize)]
struct RetrieveToolsParams {
    query: String,
    limit: Option<usize>,
    mode: Option<String>,
    weight: Option<f32>,
    #[serde(rename = "minSimilarity")]
    min_similarity: Option<f32>,
    #[serde(default)]
    debug: bool,
}

#[derive(Deserialize)]
struct CallToolParams {
    server: Option<String>,
    tool: String,
    #[serde(default)]
    arguments: Value,
    /// Per-call override of the configured call deadline.
    #[serde(rename = "timeoutMs")]
    timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
struct UpstreamServersParams {
    operation: String,
    name: Option<String>,
    server: Option<ServerConfig>,
    patch: Option<Value>,
    lines: Option<usize>,
}

#[derive(Deserialize)]
struct QuarantineParams {
    operation: String,
    name: Option<String>,
}

#[derive(Deserialize)]
struct GroupsParams {
    operation: String,
    group: Option<String>,
    server: Option<String>,
}

#[derive(Deserialize)]
struct SearchServersParams {
    registry: Option<String>,
    #[serde(default)]
    query: String,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct ReadCacheParams {
    id: String,
    #[serde(default)]
    page: usize,
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| RelayError::invalid_input(e.to_string()))
}

fn require<T>(value: Option<T>, field: &str, operation: &str) -> Result<T> {
    value.ok_or_else(|| {
        RelayError::invalid_input(format!("'{field}' is required for operation '{operation}'"))
    })
}

impl RelayFacade {
    pub fn new(
        manager: Arc<UpstreamManager>,
        cache: ResultCache,
        registries: RegistrySet,
        tools_limit: usize,
    ) -> Self {
        Self { manager, cache, registries, tools_limit }
    }

    pub fn manager(&self) -> Arc<UpstreamManager> {
        Arc::clone(&self.manager)
    }

    /// Hybrid search over the tool index. Results carry the `server:tool`
    /// prefix downstream clients pass back to `call_tool`.
    pub async fn retrieve_tools(&self, params: Value) -> Result<Value> {
        let params: RetrieveToolsParams = parse(params)?;
        if params.query.trim().is_empty() {
            return Err(RelayError::invalid_input("query must not be empty"));
        }
        let limit = params.limit.unwrap_or(self.tools_limit).clamp(1, 100);
        let mode = match params.mode.as_deref() {
            Some(text) => text.parse::<SearchMode>().map_err(RelayError::InvalidInput)?,
            None => SearchMode::default(),
        };

        let hits = self
            .manager
            .index()
            .search(&params.query, limit, mode, params.weight, params.min_similarity)
            .await?;

        let tools: Vec<Value> = hits
            .iter()
            .map(|hit| {
                let mut entry = json!({
                    "name": hit.key(),
                    "server": hit.server_name,
                    "tool": hit.tool_name,
                    "description": hit.description,
                    "score": hit.score,
                });
                if params.debug {
                    entry["keywordRank"] = json!(hit.keyword_rank);
                    entry["semanticRank"] = json!(hit.semantic_rank);
                    entry["inputSchema"] =
                        serde_json::from_str(&hit.params_json).unwrap_or(Value::Null);
                }
                entry
            })
            .collect();

        Ok(json!({ "tools": tools, "total": tools.len() }))
    }

    /// Routed invocation. Oversized results are truncated and parked in the
    /// result cache for `read_cache` pagination.
    pub async fn call_tool(&self, params: Value) -> Result<Value> {
        let params: CallToolParams = parse(params)?;
        let (server, tool) = match params.server {
            Some(server) if !server.is_empty() => (server, params.tool),
            _ => {
                let (server, tool) = parse_tool_ref(&params.tool).ok_or_else(|| {
                    RelayError::invalid_input(
                        "either 'server' or a 'server:tool' reference is required",
                    )
                })?;
                (server.to_string(), tool.to_string())
            }
        };
        let timeout = params.timeout_ms.map(std::time::Duration::from_millis);

        let result = self
            .manager
            .call_tool(&server, &tool, params.arguments, timeout)
            .await?;

        let rendered = result.to_string();
        match self.cache.truncate_and_store(&rendered) {
            Some(page) => Ok(json!({
                "truncated": true,
                "cacheId": page.cache_id,
                "totalPages": page.total_pages,
                "content": page.content,
            })),
            None => Ok(result),
        }
    }

    /// Upstream management: list / add / remove / update / patch / stop /
    /// start / tail_log.
    pub async fn upstream_servers(&self, params: Value) -> Result<Value> {
        let params: UpstreamServersParams = parse(params)?;
        match params.operation.as_str() {
            "list" => {
                let servers = self.manager.list_servers().await?;
                let candidates = self.manager.recovery_candidates().await;
                Ok(json!({
                    "servers": servers,
                    "recoveryCandidates": candidates,
                }))
            }
            "add" | "update" => {
                let config = require(params.server, "server", &params.operation)?;
                let name = config.name.clone();
                self.manager.add_or_update_server(config).await?;
                Ok(json!({ "status": "ok", "name": name }))
            }
            "remove" => {
                let name = require(params.name, "name", "remove")?;
                self.manager.remove_server(&name).await?;
                Ok(json!({ "status": "ok", "name": name }))
            }
            "patch" => {
                let name = require(params.name, "name", "patch")?;
                let patch = require(params.patch, "patch", "patch")?;
                self.patch_server(&name, patch).await?;
                Ok(json!({ "status": "ok", "name": name }))
            }
            "stop" => {
                let name = require(params.name, "name", "stop")?;
                self.manager.set_user_stopped(&name, true).await?;
                Ok(json!({ "status": "ok", "name": name }))
            }
            "start" => {
                let name = require(params.name, "name", "start")?;
                self.manager.set_user_stopped(&name, false).await?;
                Ok(json!({ "status": "ok", "name": name }))
            }
            "tail_log" => {
                let name = require(params.name, "name", "tail_log")?;
                let lines = params.lines.unwrap_or(100).clamp(1, 1000);
                let log_lines = self.manager.log().tail(&name, lines)?;
                Ok(json!({ "name": name, "lines": log_lines }))
            }
            other => Err(RelayError::invalid_input(format!(
                "unknown upstream_servers operation '{other}'"
            ))),
        }
    }

    /// Patch semantics: `enabled` toggles the canonical startup mode (and
    /// clears any auto-disable reason on enable); remaining fields are
    /// merged onto the stored config.
    async fn patch_server(&self, name: &str, patch: Value) -> Result<()> {
        let Value::Object(mut fields) = patch else {
            return Err(RelayError::invalid_input("patch must be an object"));
        };

        if let Some(enabled) = fields.remove("enabled") {
            let enabled = enabled
                .as_bool()
                .ok_or_else(|| RelayError::invalid_input("'enabled' must be a boolean"))?;
            self.manager.enable_server(name, enabled).await?;
        }
        if fields.is_empty() {
            return Ok(());
        }

        let record = self
            .manager
            .storage()
            .get_server(name)?
            .ok_or_else(|| RelayError::NotFound(name.to_string()))?;
        let mut merged = serde_json::to_value(&record.config)
            .map_err(|e| RelayError::persistence(e))?;
        let Value::Object(target) = &mut merged else {
            return Err(RelayError::Fatal("server config did not serialize to an object".into()));
        };
        for (key, value) in fields {
            if key == "name" {
                return Err(RelayError::invalid_input("server names are immutable"));
            }
            target.insert(key, value);
        }
        let mut config: ServerConfig =
            serde_json::from_value(merged).map_err(|e| RelayError::invalid_input(e.to_string()))?;
        config.migrate_legacy_flags();
        debug!(server = name, "applying config patch");
        self.manager.add_or_update_server(config).await
    }

    pub async fn quarantine_security(&self, params: Value) -> Result<Value> {
        let params: QuarantineParams = parse(params)?;
        match params.operation.as_str() {
            "list" => {
                let servers = self.manager.list_servers().await?;
                let quarantined: Vec<_> = servers
                    .into_iter()
                    .filter(|v| v.config.startup_mode == StartupMode::Quarantined)
                    .collect();
                Ok(json!({ "servers": quarantined }))
            }
            "inspect" => {
                let name = require(params.name, "name", "inspect")?;
                let servers = self.manager.list_servers().await?;
                let view = servers
                    .into_iter()
                    .find(|v| v.config.name == name)
                    .ok_or_else(|| RelayError::NotFound(name.clone()))?;
                let tools = self
                    .manager
                    .client(&name)
                    .await
                    .map(|c| c.tools())
                    .unwrap_or_default();
                Ok(json!({ "server": view, "tools": tools }))
            }
            "quarantine" => {
                let name = require(params.name, "name", "quarantine")?;
                self.manager.set_quarantined(&name, true).await?;
                Ok(json!({ "status": "ok", "name": name }))
            }
            "unquarantine" => {
                let name = require(params.name, "name", "unquarantine")?;
                self.manager.set_quarantined(&name, false).await?;
                Ok(json!({ "status": "ok", "name": name }))
            }
            other => Err(RelayError::invalid_input(format!(
                "unknown quarantine_security operation '{other}'"
            ))),
        }
    }

    pub async fn groups(&self, params: Value) -> Result<Value> {
        let params: GroupsParams = parse(params)?;
        let storage = self.manager.storage();
        match params.operation.as_str() {
            "list" => Ok(json!({ "groups": storage.groups() })),
            "get_group_servers" => {
                let group = require(params.group, "group", "get_group_servers")?;
                let members = storage
                    .groups()
                    .get(&group)
                    .cloned()
                    .ok_or_else(|| RelayError::NotFound(format!("group '{group}'")))?;
                Ok(json!({ "group": group, "servers": members }))
            }
            "assign" => {
                let group = require(params.group, "group", "assign")?;
                let server = require(params.server, "server", "assign")?;
                if storage.get_server(&server)?.is_none() {
                    return Err(RelayError::NotFound(server));
                }
                let mut members = storage.groups().get(&group).cloned().unwrap_or_default();
                if !members.contains(&server) {
                    members.push(server);
                    storage.set_group(&group, Some(members))?;
                }
                Ok(json!({ "status": "ok", "group": group }))
            }
            "unassign" => {
                let group = require(params.group, "group", "unassign")?;
                let server = require(params.server, "server", "unassign")?;
                let mut members = storage
                    .groups()
                    .get(&group)
                    .cloned()
                    .ok_or_else(|| RelayError::NotFound(format!("group '{group}'")))?;
                members.retain(|m| m != &server);
                if members.is_empty() {
                    storage.set_group(&group, None)?;
                } else {
                    storage.set_group(&group, Some(members))?;
                }
                Ok(json!({ "status": "ok", "group": group }))
            }
            "enable_group" | "disable_group" => {
                let group = require(params.group, "group", &params.operation)?;
                let enabled = params.operation == "enable_group";
                let members = self.manager.set_group_enabled(&group, enabled).await?;
                Ok(json!({ "status": "ok", "group": group, "servers": members }))
            }
            other => Err(RelayError::invalid_input(format!(
                "unknown groups operation '{other}'"
            ))),
        }
    }

    pub async fn search_servers(&self, params: Value) -> Result<Value> {
        let params: SearchServersParams = parse(params)?;
        let limit = params.limit.unwrap_or(20).clamp(1, 100);
        let results = self
            .registries
            .search(params.registry.as_deref(), &params.query, limit)
            .await?;
        let rendered: Vec<Value> = results
            .into_iter()
            .map(|(registry, entries)| json!({ "registry": registry, "entries": entries }))
            .collect();
        Ok(json!({ "results": rendered }))
    }

    pub fn list_registries(&self) -> Result<Value> {
        Ok(json!({ "registries": self.registries.list() }))
    }

    pub fn read_cache(&self, params: Value) -> Result<Value> {
        let params: ReadCacheParams = parse(params)?;
        let page = self.cache.read(&params.id, params.page)?;
        Ok(serde_json::to_value(page).map_err(RelayError::persistence)?)
    }
}
