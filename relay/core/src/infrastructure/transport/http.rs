// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP / streamable-HTTP transport: JSON-RPC requests as HTTP POST bodies
//! over a keep-alive client.
//!
//! Streamable-HTTP servers assign a session via the `Mcp-Session-Id`
//! response header on `initialize`; the transport echoes it on every
//! subsequent request. Responses may come back as plain JSON or as a short
//! SSE body (`text/event-stream`) whose first `message` event carries the
//! JSON-RPC response.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::error::{RelayError, Result};
use crate::domain::server::ServerConfig;
use crate::infrastructure::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::infrastructure::transport::sse::extract_sse_data;
use crate::infrastructure::transport::Transport;

const SESSION_HEADER: &str = "Mcp-Session-Id";

pub struct HttpTransport {
    server_name: String,
    url: String,
    headers: Vec<(String, String)>,
    oauth_hinted: bool,
    client: reqwest::Client,
    session: Mutex<Option<String>>,
    next_id: std::sync::atomic::AtomicU64,
    closed: CancellationToken,
}

impl HttpTransport {
    pub fn open(config: &ServerConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| RelayError::invalid_input(format!(
                "http server '{}' has no url",
                config.name
            )))?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(RelayError::transport)?;
        Ok(Self {
            server_name: config.name.clone(),
            url,
            headers: config.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            oauth_hinted: config.oauth.is_some(),
            client,
            session: Mutex::new(None),
            next_id: std::sync::atomic::AtomicU64::new(1),
            closed: CancellationToken::new(),
        })
    }

    async fn post(&self, body: &JsonRpcRequest) -> Result<Option<JsonRpcResponse>> {
        if self.closed.is_cancelled() {
            return Err(RelayError::Transport(format!(
                "connection to '{}' is closed",
                self.server_name
            )));
        }

        let mut request = self
            .client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(body);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(session) = self.session.lock().clone() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(RelayError::transport)?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            if self.oauth_hinted {
                return Err(RelayError::OAuthRequired(self.server_name.clone()));
            }
            return Err(RelayError::Transport(format!(
                "'{}' returned 401 and no oauth configuration is present",
                self.server_name
            )));
        }
        if !response.status().is_success() {
            return Err(RelayError::Transport(format!(
                "'{}' returned HTTP {}",
                self.server_name,
                response.status()
            )));
        }

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session.lock() = Some(session.to_string());
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let text = response.text().await.map_err(RelayError::transport)?;

        if body.is_notification() || text.trim().is_empty() {
            return Ok(None);
        }

        let payload = if content_type.starts_with("text/event-stream") {
            extract_sse_data(&text).ok_or_else(|| {
                RelayError::Transport(format!(
                    "'{}' returned an event stream with no message",
                    self.server_name
                ))
            })?
        } else {
            text
        };

        let parsed: JsonRpcResponse = serde_json::from_str(&payload).map_err(|e| {
            RelayError::Transport(format!("'{}' returned invalid JSON-RPC: {e}", self.server_name))
        })?;
        Ok(Some(parsed))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        match self.post(&request).await? {
            Some(response) => response.into_result(),
            None => Err(RelayError::Transport(format!(
                "'{}' returned no body for request '{method}'",
                self.server_name
            ))),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let notification = JsonRpcRequest::notification(method, params);
        self.post(&notification).await?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
        debug!(server = %self.server_name, "http transport closed");
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_requires_url() {
        let config = ServerConfig::stdio("s", "cmd", &[]);
        assert!(HttpTransport::open(&config).is_err());
    }

    #[tokio::test]
    async fn closed_transport_refuses_requests() {
        let config = crate::domain::server::ServerConfig::network(
            "n",
            crate::domain::server::Protocol::Http,
            "http://127.0.0.1:1/mcp",
        );
        let transport = HttpTransport::open(&config).unwrap();
        transport.close().await;
        let err = transport
            .request("tools/list", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Transport(m) if m.contains("closed")));
    }
}
