// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! JSON-RPC 2.0 framing and MCP message shapes.
//!
//! Shared by both sides of the relay: the upstream transports (client role)
//! and the downstream endpoint (server role). Messages are framed as single
//! JSON objects per line over stdio; network transports carry the same
//! objects in HTTP bodies or SSE `data:` fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::domain::error::{RelayError, Result};

/// MCP protocol revision the relay negotiates.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC request ids may be numbers or strings; upstreams echo whichever
/// form we sent, downstream clients pick their own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(RequestId::Number(id)),
            method: method.into(),
            params: Some(params),
        }
    }

    /// Notifications carry no id and receive no response.
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data: None }),
        }
    }

    /// Unwrap into the result value or a transport error carrying the
    /// upstream's message.
    pub fn into_result(self) -> Result<Value> {
        if let Some(err) = self.error {
            return Err(RelayError::Transport(format!(
                "upstream error {}: {}",
                err.code, err.message
            )));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

// ── MCP payload shapes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

pub fn initialize_params(client_name: &str) -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "clientInfo": {
            "name": client_name,
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(rename = "serverInfo", default)]
    pub server_info: Option<Implementation>,
    #[serde(default)]
    pub capabilities: Value,
}

/// One tool as described by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<WireTool>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

pub fn call_tool_params(tool: &str, arguments: Value) -> Value {
    serde_json::json!({ "name": tool, "arguments": arguments })
}

// ── Line framing over stdio ────────────────────────────────────────────────

/// Read one newline-delimited JSON value. `Ok(None)` means clean EOF.
pub async fn read_json_line<R>(reader: &mut BufReader<R>) -> Result<Option<Value>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(serde_json::from_str(trimmed)?));
    }
}

/// Write one value as a single line.
pub async fn write_json_line<W>(writer: &mut W, value: &impl Serialize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_id_forms_round_trip() {
        let req = JsonRpcRequest::new(7, "tools/list", json!({}));
        let text = serde_json::to_string(&req).unwrap();
        let back: JsonRpcRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, Some(RequestId::Number(7)));

        let resp: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc","result":{}}"#).unwrap();
        assert_eq!(resp.id, Some(RequestId::String("abc".into())));
    }

    #[test]
    fn notifications_omit_id() {
        let notif = JsonRpcRequest::notification("notifications/initialized", json!({}));
        assert!(notif.is_notification());
        let text = serde_json::to_string(&notif).unwrap();
        assert!(!text.contains("\"id\""));
    }

    #[test]
    fn error_response_surfaces_as_transport_failure() {
        let resp = JsonRpcResponse::failure(
            Some(RequestId::Number(1)),
            error_codes::INTERNAL_ERROR,
            "boom",
        );
        let err = resp.into_result().unwrap_err();
        assert!(matches!(err, RelayError::Transport(m) if m.contains("boom")));
    }

    #[test]
    fn wire_tool_tolerates_missing_fields() {
        let result: ToolsListResult = serde_json::from_value(json!({
            "tools": [ { "name": "bare" } ]
        }))
        .unwrap();
        assert_eq!(result.tools[0].name, "bare");
        assert!(result.tools[0].description.is_none());
    }

    #[tokio::test]
    async fn line_framing_round_trips_and_skips_blanks() {
        let input = b"\n{\"a\":1}\n\n{\"b\":2}\n".to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(input));
        assert_eq!(read_json_line(&mut reader).await.unwrap(), Some(json!({"a":1})));
        assert_eq!(read_json_line(&mut reader).await.unwrap(), Some(json!({"b":2})));
        assert_eq!(read_json_line(&mut reader).await.unwrap(), None);

        let mut out = Vec::new();
        write_json_line(&mut out, &json!({"x": true})).await.unwrap();
        assert_eq!(out, b"{\"x\":true}\n");
    }
}
