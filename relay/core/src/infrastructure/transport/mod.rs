// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Upstream Transports
//!
//! A closed set of transport variants behind one capability trait. The
//! managed client selects the variant from the server's `protocol` field:
//!
//! | Protocol | Variant | Mechanics |
//! |----------|---------|-----------|
//! | `stdio` | [`stdio::StdioTransport`] | spawn subprocess, JSON lines over stdin/stdout, stderr → per-server log |
//! | `http`, `streamable-http` | [`http::HttpTransport`] | JSON-RPC over HTTP POST, optional session header |
//! | `sse` | [`sse::SseTransport`] | SSE stream for responses, HTTP POST for requests |
//!
//! Connect deadlines are applied by the caller (`tokio::time::timeout`
//! around [`connect`]); every variant exposes a clean [`Transport::close`]
//! that stops pending reads, and a [`Transport::closed`] token the client
//! watches to observe unexpected connection loss.

pub mod http;
pub mod sse;
pub mod stdio;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::domain::error::{RelayError, Result};
use crate::domain::server::{Protocol, ServerConfig};
use crate::infrastructure::logs::LogSink;
use crate::infrastructure::protocol::{JsonRpcResponse, RequestId};

/// Uniform capability over all transport variants.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and await its correlated response value.
    async fn request(&self, method: &str, params: Value) -> Result<Value>;

    /// Fire-and-forget notification.
    async fn notify(&self, method: &str, params: Value) -> Result<()>;

    /// Stop pending reads and release the connection / subprocess.
    async fn close(&self);

    /// Token cancelled when the transport dies (process exit, stream EOF,
    /// explicit close).
    fn closed(&self) -> CancellationToken;
}

/// Establish a transport for `config`. The caller bounds this with its
/// connect deadline and calls [`Transport::close`] on abandonment.
pub async fn connect(config: &ServerConfig, log: Arc<LogSink>) -> Result<Box<dyn Transport>> {
    match config.protocol {
        Protocol::Stdio => Ok(Box::new(stdio::StdioTransport::spawn(config, log).await?)),
        Protocol::Http | Protocol::StreamableHttp => {
            Ok(Box::new(http::HttpTransport::open(config)?))
        }
        Protocol::Sse => Ok(Box::new(sse::SseTransport::open(config).await?)),
    }
}

/// Correlates request ids with their waiting callers.
#[derive(Debug)]
pub(crate) struct PendingMap {
    next_id: AtomicU64,
    waiting: parking_lot::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingMap {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), waiting: parking_lot::Mutex::new(HashMap::new()) }
    }

    pub fn register(&self) -> (u64, oneshot::Receiver<JsonRpcResponse>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(id, tx);
        (id, rx)
    }

    pub fn forget(&self, id: u64) {
        self.waiting.lock().remove(&id);
    }

    /// Route a response to its caller. Returns false for unknown ids
    /// (already-forgotten callers, unsolicited messages).
    pub fn complete(&self, id: &RequestId, response: JsonRpcResponse) -> bool {
        let RequestId::Number(n) = id else { return false };
        match self.waiting.lock().remove(n) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop every waiting caller; their receivers observe closure.
    pub fn fail_all(&self) {
        self.waiting.lock().clear();
    }
}

/// Await a registered response, mapping channel closure (transport death)
/// onto a transport failure.
pub(crate) async fn await_response(
    server: &str,
    rx: oneshot::Receiver<JsonRpcResponse>,
) -> Result<Value> {
    match rx.await {
        Ok(response) => response.into_result(),
        Err(_) => Err(RelayError::Transport(format!(
            "connection to '{server}' closed while awaiting response"
        ))),
    }
}
