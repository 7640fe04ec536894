// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Downstream MCP endpoint: serves the fixed meta-tool surface over stdio
//! JSON-RPC to IDE / assistant clients.
//!
//! Tool names and parameter shapes here are the public contract — adding an
//! operation is backward-compatible, renaming is not.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::facade::RelayFacade;
use crate::domain::error::{RelayError, Result};
use crate::infrastructure::protocol::{
    error_codes, read_json_line, write_json_line, JsonRpcRequest, JsonRpcResponse,
    PROTOCOL_VERSION,
};

/// Serve the facade over stdin/stdout until EOF or cancellation.
pub async fn serve_stdio(facade: Arc<RelayFacade>, cancel: CancellationToken) -> Result<()> {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut writer = tokio::io::stdout();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_json_line(&mut reader) => frame,
        };
        let value = match frame {
            Ok(Some(value)) => value,
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "undecodable frame from downstream client");
                let response = JsonRpcResponse::failure(None, error_codes::PARSE_ERROR, err.to_string());
                write_json_line(&mut writer, &response).await?;
                continue;
            }
        };

        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(err) => {
                let response =
                    JsonRpcResponse::failure(None, error_codes::INVALID_REQUEST, err.to_string());
                write_json_line(&mut writer, &response).await?;
                continue;
            }
        };

        if let Some(response) = handle_request(&facade, request).await {
            write_json_line(&mut writer, &response).await?;
        }
    }
    Ok(())
}

/// Handle one downstream request. Notifications yield no response.
pub async fn handle_request(
    facade: &RelayFacade,
    request: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    let id = request.id.clone();
    debug!(method = %request.method, "downstream request");

    let result: Result<Value> = match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": {
                "name": "aegis-relay",
                "version": env!("CARGO_PKG_VERSION"),
            }
        })),
        "notifications/initialized" | "notifications/cancelled" => return None,
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tool_definitions() })),
        "tools/call" => {
            let params = request.params.unwrap_or(Value::Null);
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            dispatch_tool(facade, &name, arguments).await.map(render_tool_result)
        }
        _ => {
            let id = id?;
            return Some(JsonRpcResponse::failure(
                Some(id),
                error_codes::METHOD_NOT_FOUND,
                format!("method '{}' is not supported", request.method),
            ));
        }
    };

    let id = id?;
    Some(match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(err) if request.method == "tools/call" => {
            // Tool-level failures are structured results, not protocol
            // errors, so clients can read the error kind.
            JsonRpcResponse::success(id, render_tool_error(&err))
        }
        Err(err) => JsonRpcResponse::failure(Some(id), error_codes::INTERNAL_ERROR, err.to_string()),
    })
}

async fn dispatch_tool(facade: &RelayFacade, name: &str, arguments: Value) -> Result<Value> {
    match name {
        "retrieve_tools" => facade.retrieve_tools(arguments).await,
        "call_tool" => facade.call_tool(arguments).await,
        "upstream_servers" => facade.upstream_servers(arguments).await,
        "quarantine_security" => facade.quarantine_security(arguments).await,
        "groups" => facade.groups(arguments).await,
        "search_servers" => facade.search_servers(arguments).await,
        "list_registries" => facade.list_registries(),
        "read_cache" => facade.read_cache(arguments),
        other => Err(RelayError::invalid_input(format!("unknown tool '{other}'"))),
    }
}

fn render_tool_result(value: Value) -> Value {
    json!({
        "content": [ { "type": "text", "text": value.to_string() } ],
        "isError": false,
    })
}

fn render_tool_error(err: &RelayError) -> Value {
    json!({
        "content": [ { "type": "text", "text": err.to_string() } ],
        "isError": true,
        "error": {
            "kind": err.kind().as_str(),
            "message": err.to_string(),
        }
    })
}

fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "retrieve_tools",
            "description": "Search the aggregated upstream tools by keyword, semantic or hybrid ranking. Returns server-prefixed tool names for call_tool.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "What you want to do" },
                    "limit": { "type": "integer", "default": 15 },
                    "mode": { "type": "string", "enum": ["keyword", "semantic", "hybrid"] },
                    "weight": { "type": "number", "minimum": 0, "maximum": 1 },
                    "debug": { "type": "boolean" }
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "call_tool",
            "description": "Invoke an upstream tool by server and tool name (or a combined server:tool reference).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "server": { "type": "string" },
                    "tool": { "type": "string" },
                    "arguments": { "type": "object" }
                },
                "required": ["tool"]
            }
        }),
        json!({
            "name": "upstream_servers",
            "description": "Manage upstream MCP servers: list, add, remove, update, patch, stop, start, tail_log.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "operation": { "type": "string", "enum": ["list", "add", "remove", "update", "patch", "stop", "start", "tail_log"] },
                    "name": { "type": "string" },
                    "server": { "type": "object" },
                    "patch": { "type": "object" },
                    "lines": { "type": "integer" }
                },
                "required": ["operation"]
            }
        }),
        json!({
            "name": "quarantine_security",
            "description": "Inspect and control the security quarantine for upstream servers.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "operation": { "type": "string", "enum": ["list", "inspect", "quarantine", "unquarantine"] },
                    "name": { "type": "string" }
                },
                "required": ["operation"]
            }
        }),
        json!({
            "name": "groups",
            "description": "Bulk state control over user-defined server groups.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "operation": { "type": "string", "enum": ["list", "assign", "unassign", "enable_group", "disable_group", "get_group_servers"] },
                    "group": { "type": "string" },
                    "server": { "type": "string" }
                },
                "required": ["operation"]
            }
        }),
        json!({
            "name": "search_servers",
            "description": "Search configured MCP server registries for installable upstreams.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "registry": { "type": "string" },
                    "query": { "type": "string" },
                    "limit": { "type": "integer" }
                }
            }
        }),
        json!({
            "name": "list_registries",
            "description": "List the configured MCP server registries.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "read_cache",
            "description": "Page through a previously truncated tool result.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "id": { "type": "string" },
                    "page": { "type": "integer", "default": 0 }
                },
                "required": ["id"]
            }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::cache::ResultCache;
    use crate::application::registry::RegistrySet;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::index::ToolIndex;
    use crate::infrastructure::logs::LogSink;
    use crate::infrastructure::manager::{ManagerOptions, UpstreamManager};
    use crate::infrastructure::protocol::RequestId;
    use crate::infrastructure::storage::Storage;

    async fn facade() -> (RelayFacade, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let storage = Arc::new(
            Storage::open(dir.path(), &dir.path().join("config.json"), bus.clone()).unwrap(),
        );
        let index = Arc::new(ToolIndex::keyword_only());
        let log = Arc::new(LogSink::open(&dir.path().join("logs")).unwrap());
        let manager =
            UpstreamManager::new(bus, storage, index, log, ManagerOptions::default()).unwrap();
        (
            RelayFacade::new(manager, ResultCache::default(), RegistrySet::new(), 15),
            dir,
        )
    }

    fn request(id: u64, method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest::new(id, method, params)
    }

    #[tokio::test]
    async fn initialize_advertises_tools_capability() {
        let (facade, _dir) = facade().await;
        let response = handle_request(&facade, request(1, "initialize", json!({})))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "aegis-relay");
    }

    #[tokio::test]
    async fn tools_list_is_the_fixed_surface() {
        let (facade, _dir) = facade().await;
        let response = handle_request(&facade, request(2, "tools/list", json!({})))
            .await
            .unwrap();
        let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(
            names,
            vec![
                "retrieve_tools",
                "call_tool",
                "upstream_servers",
                "quarantine_security",
                "groups",
                "search_servers",
                "list_registries",
                "read_cache"
            ]
        );
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let (facade, _dir) = facade().await;
        let notification = JsonRpcRequest::notification("notifications/initialized", json!({}));
        assert!(handle_request(&facade, notification).await.is_none());
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let (facade, _dir) = facade().await;
        let response = handle_request(&facade, request(3, "resources/list", json!({})))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn tool_errors_are_structured_results() {
        let (facade, _dir) = facade().await;
        let response = handle_request(
            &facade,
            request(4, "tools/call", json!({ "name": "retrieve_tools", "arguments": { "query": "" } })),
        )
        .await
        .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        assert_eq!(result["error"]["kind"], "invalid_input");
        assert_eq!(response.id, Some(RequestId::Number(4)));
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_input() {
        let (facade, _dir) = facade().await;
        let response = handle_request(
            &facade,
            request(5, "tools/call", json!({ "name": "bogus", "arguments": {} })),
        )
        .await
        .unwrap();
        assert_eq!(response.result.unwrap()["error"]["kind"], "invalid_input");
    }
}
