// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP surface (axum): the WebSocket endpoints plus a `/healthz` snapshot
//! consumed by the external tray / status-page collaborators.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::domain::error::{RelayError, Result};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::manager::UpstreamManager;
use crate::presentation::ws;

pub struct HttpState {
    pub bus: EventBus,
    pub manager: Arc<UpstreamManager>,
}

pub fn app(bus: EventBus, manager: Arc<UpstreamManager>) -> Router {
    let state = Arc::new(HttpState { bus, manager });
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws/events", get(ws::ws_events))
        .route("/ws/servers", get(ws::ws_servers))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let stats = state.manager.get_stats().await;
    Json(json!({
        "state": state.manager.app_state(),
        "servers": stats,
    }))
}

/// Bind and serve until the token cancels.
pub async fn serve(listen: &str, router: Router, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| RelayError::Transport(format!("failed to bind {listen}: {e}")))?;
    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "http surface listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(RelayError::transport)
}
