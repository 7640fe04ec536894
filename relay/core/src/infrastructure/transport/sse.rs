// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! SSE transport: responses arrive on a long-lived `text/event-stream`
//! connection, requests go out as HTTP POSTs.
//!
//! On connect the server announces its POST endpoint in an `endpoint` event;
//! subsequent `message` events carry JSON-RPC responses that are routed to
//! waiting callers by id.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::domain::error::{RelayError, Result};
use crate::domain::server::ServerConfig;
use crate::infrastructure::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::infrastructure::transport::{await_response, PendingMap, Transport};

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental SSE field parser. Feed it lines; it yields an event at each
/// blank-line dispatch boundary.
#[derive(Default)]
pub struct SseParser {
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            if self.data.is_empty() {
                self.event = None;
                return None;
            }
            let event = SseEvent {
                event: self.event.take().unwrap_or_else(|| "message".to_string()),
                data: self.data.join("\n"),
            };
            self.data.clear();
            return Some(event);
        }
        if let Some(rest) = line.strip_prefix("event:") {
            self.event = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        // Comments (leading ':') and unknown fields are ignored.
        None
    }
}

/// First `message` data payload in a complete SSE body. Used by the
/// streamable-HTTP transport for event-stream response bodies.
pub fn extract_sse_data(body: &str) -> Option<String> {
    let mut parser = SseParser::default();
    for line in body.lines().chain(std::iter::once("")) {
        if let Some(event) = parser.feed_line(line) {
            if event.event == "message" {
                return Some(event.data);
            }
        }
    }
    None
}

struct SseStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: String,
    parser: SseParser,
}

impl SseStream {
    fn new(inner: BoxStream<'static, reqwest::Result<Bytes>>) -> Self {
        Self { inner, buffer: String::new(), parser: SseParser::default() }
    }

    /// Next parsed event, or `None` on stream end.
    async fn next_event(&mut self) -> Result<Option<SseEvent>> {
        loop {
            // Drain complete lines already buffered.
            while let Some(pos) = self.buffer.find('\n') {
                let line: String = self.buffer.drain(..=pos).collect();
                if let Some(event) = self.parser.feed_line(line.trim_end_matches('\n')) {
                    return Ok(Some(event));
                }
            }
            match self.inner.next().await {
                Some(Ok(chunk)) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                }
                Some(Err(err)) => return Err(RelayError::transport(err)),
                None => return Ok(None),
            }
        }
    }
}

pub struct SseTransport {
    server_name: String,
    endpoint: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
    pending: Arc<PendingMap>,
    closed: CancellationToken,
}

impl SseTransport {
    pub async fn open(config: &ServerConfig) -> Result<Self> {
        let base_url = config
            .url
            .clone()
            .ok_or_else(|| RelayError::invalid_input(format!(
                "sse server '{}' has no url",
                config.name
            )))?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(RelayError::transport)?;

        let mut request = client
            .get(&base_url)
            .header("Accept", "text/event-stream");
        for (key, value) in &config.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let response = request.send().await.map_err(RelayError::transport)?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            if config.oauth.is_some() {
                return Err(RelayError::OAuthRequired(config.name.clone()));
            }
            return Err(RelayError::Transport(format!(
                "'{}' returned 401 and no oauth configuration is present",
                config.name
            )));
        }
        if !response.status().is_success() {
            return Err(RelayError::Transport(format!(
                "'{}' returned HTTP {}",
                config.name,
                response.status()
            )));
        }

        let mut stream = SseStream::new(response.bytes_stream().boxed());

        // The server must announce its POST endpoint before anything else.
        let endpoint = loop {
            match stream.next_event().await? {
                Some(event) if event.event == "endpoint" => {
                    break resolve_endpoint(&base_url, &event.data)?;
                }
                Some(other) => {
                    trace!(server = %config.name, event = %other.event, "skipping pre-endpoint event");
                }
                None => {
                    return Err(RelayError::Transport(format!(
                        "'{}' closed the event stream before announcing an endpoint",
                        config.name
                    )));
                }
            }
        };

        let pending = Arc::new(PendingMap::new());
        let closed = CancellationToken::new();

        // Reader: route message events to waiting callers until close or EOF.
        {
            let pending = Arc::clone(&pending);
            let closed = closed.clone();
            let server = config.name.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = closed.cancelled() => break,
                        event = stream.next_event() => {
                            match event {
                                Ok(Some(event)) if event.event == "message" => {
                                    match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                                        Ok(response) => {
                                            if let Some(id) = response.id.clone() {
                                                pending.complete(&id, response);
                                            }
                                        }
                                        Err(err) => trace!(server, %err, "undecodable message event"),
                                    }
                                }
                                Ok(Some(_)) => {}
                                Ok(None) => break,
                                Err(err) => {
                                    debug!(server, %err, "event stream failed");
                                    break;
                                }
                            }
                        }
                    }
                }
                pending.fail_all();
                closed.cancel();
            });
        }

        Ok(Self {
            server_name: config.name.clone(),
            endpoint,
            headers: config.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            client,
            pending,
            closed,
        })
    }

    async fn post(&self, body: &JsonRpcRequest) -> Result<()> {
        let mut request = self.client.post(&self.endpoint).json(body);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let response = request.send().await.map_err(RelayError::transport)?;
        if !response.status().is_success() {
            return Err(RelayError::Transport(format!(
                "'{}' rejected POST with HTTP {}",
                self.server_name,
                response.status()
            )));
        }
        Ok(())
    }
}

fn resolve_endpoint(base: &str, endpoint: &str) -> Result<String> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return Ok(endpoint.to_string());
    }
    let base = url::Url::parse(base)
        .map_err(|e| RelayError::Transport(format!("invalid base url: {e}")))?;
    let joined = base
        .join(endpoint)
        .map_err(|e| RelayError::Transport(format!("invalid endpoint '{endpoint}': {e}")))?;
    Ok(joined.to_string())
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let (id, rx) = self.pending.register();
        let request = JsonRpcRequest::new(id, method, params);
        if let Err(err) = self.post(&request).await {
            self.pending.forget(id);
            return Err(err);
        }
        tokio::select! {
            _ = self.closed.cancelled() => {
                self.pending.forget(id);
                Err(RelayError::Transport(format!(
                    "connection to '{}' is closed",
                    self.server_name
                )))
            }
            result = await_response(&self.server_name, rx) => result,
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.post(&JsonRpcRequest::notification(method, params)).await
    }

    async fn close(&self) {
        self.closed.cancel();
        self.pending.fail_all();
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_dispatches_on_blank_line() {
        let mut parser = SseParser::default();
        assert!(parser.feed_line("event: endpoint").is_none());
        assert!(parser.feed_line("data: /messages?sessionId=42").is_none());
        let event = parser.feed_line("").unwrap();
        assert_eq!(event.event, "endpoint");
        assert_eq!(event.data, "/messages?sessionId=42");
    }

    #[test]
    fn parser_defaults_event_type_and_joins_data() {
        let mut parser = SseParser::default();
        parser.feed_line("data: {\"a\":");
        parser.feed_line("data: 1}");
        let event = parser.feed_line("").unwrap();
        assert_eq!(event.event, "message");
        assert_eq!(event.data, "{\"a\":\n1}");
    }

    #[test]
    fn parser_ignores_comments_and_crlf() {
        let mut parser = SseParser::default();
        assert!(parser.feed_line(": keepalive").is_none());
        assert!(parser.feed_line("").is_none());
        parser.feed_line("data: x\r");
        let event = parser.feed_line("\r").unwrap();
        assert_eq!(event.data, "x");
    }

    #[test]
    fn extract_first_message_payload() {
        let body = "event: ping\ndata: {}\n\ndata: {\"jsonrpc\":\"2.0\"}\n\n";
        assert_eq!(extract_sse_data(body).unwrap(), "{\"jsonrpc\":\"2.0\"}");
    }

    #[test]
    fn endpoint_resolution() {
        assert_eq!(
            resolve_endpoint("http://localhost:3000/sse", "/messages?sessionId=1").unwrap(),
            "http://localhost:3000/messages?sessionId=1"
        );
        assert_eq!(
            resolve_endpoint("http://localhost:3000/sse", "https://other/m").unwrap(),
            "https://other/m"
        );
        assert!(resolve_endpoint("not a url", "/messages").is_err());
    }
}
