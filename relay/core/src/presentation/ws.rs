// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! WebSocket broadcaster: fans bus events out to browser / tray subscribers.
//!
//! Two endpoints: `/ws/events` (everything) and `/ws/servers?server=NAME`
//! (filtered to one server). Each connection gets its own bounded
//! 256-message queue — a slow client loses events (counted) instead of
//! blocking the bus. Pings go out every ~54 s; a client that has not ponged
//! within 60 s is closed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::domain::events::Event;
use crate::presentation::http::HttpState;

/// Per-connection outbound queue depth.
const CLIENT_QUEUE: usize = 256;
const PING_INTERVAL: Duration = Duration::from_secs(54);
const PONG_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
pub struct ServerFilter {
    pub server: Option<String>,
}

pub async fn ws_events(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HttpState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, None))
}

pub async fn ws_servers(
    ws: WebSocketUpgrade,
    Query(filter): Query<ServerFilter>,
    State(state): State<Arc<HttpState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, filter.server))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<HttpState>, filter: Option<String>) {
    let mut subscription = state.bus.subscribe_all();
    let (queue_tx, mut queue_rx) = mpsc::channel::<Event>(CLIENT_QUEUE);

    // Forwarder: bus → bounded per-client queue, dropping on overflow.
    let forwarder = tokio::spawn(async move {
        let mut dropped = 0u64;
        while let Some(event) = subscription.recv().await {
            if let Some(server) = &filter {
                match event.payload.server_name() {
                    Some(name) if name == server => {}
                    _ => continue,
                }
            }
            if queue_tx.try_send(event).is_err() {
                dropped += 1;
                trace!(dropped, "websocket client queue full; event dropped");
            }
        }
        if dropped > 0 {
            debug!(dropped, "websocket client lost events to backpressure");
        }
    });

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.tick().await; // immediate first tick
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            event = queue_rx.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ping_timer.tick() => {
                if last_pong.elapsed() > PONG_DEADLINE {
                    debug!("websocket client missed pong deadline; closing");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // inbound data frames are ignored
                    Some(Err(_)) => break,
                }
            }
        }
    }

    forwarder.abort();
    let _ = socket.send(Message::Close(None)).await;
}
