// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Domain events published on the relay event bus.
//!
//! The event kind set is closed: subscribers filter by [`EventKind`] and the
//! WebSocket broadcaster serializes [`Event`] payloads verbatim to browser
//! and tray subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::server::{AppState, ConnectionState};

/// Action discriminant for configuration-change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigAction {
    Created,
    Updated,
    Deleted,
}

/// Closed set of event kinds, used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ServerStateChanged,
    ServerConfigChanged,
    ServerAutoDisabled,
    ServerGroupUpdated,
    AppStateChanged,
    ToolsUpdated,
    ToolCalled,
    ConnectionEstablished,
    ConnectionLost,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::ServerStateChanged,
        EventKind::ServerConfigChanged,
        EventKind::ServerAutoDisabled,
        EventKind::ServerGroupUpdated,
        EventKind::AppStateChanged,
        EventKind::ToolsUpdated,
        EventKind::ToolCalled,
        EventKind::ConnectionEstablished,
        EventKind::ConnectionLost,
    ];
}

/// Typed event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ServerStateChanged {
        server_name: String,
        old_state: ConnectionState,
        new_state: ConnectionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        info: Option<String>,
    },
    ServerConfigChanged {
        server_name: String,
        action: ConfigAction,
    },
    ServerAutoDisabled {
        server_name: String,
        reason: String,
        consecutive_failures: u32,
    },
    ServerGroupUpdated {
        group: String,
        servers: Vec<String>,
    },
    AppStateChanged {
        old_state: AppState,
        new_state: AppState,
    },
    ToolsUpdated {
        server_name: String,
        tool_count: usize,
    },
    ToolCalled {
        server_name: String,
        tool_name: String,
        duration_ms: u64,
        success: bool,
    },
    ConnectionEstablished {
        server_name: String,
        time_to_connect_ms: u64,
    },
    ConnectionLost {
        server_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ServerStateChanged { .. } => EventKind::ServerStateChanged,
            Self::ServerConfigChanged { .. } => EventKind::ServerConfigChanged,
            Self::ServerAutoDisabled { .. } => EventKind::ServerAutoDisabled,
            Self::ServerGroupUpdated { .. } => EventKind::ServerGroupUpdated,
            Self::AppStateChanged { .. } => EventKind::AppStateChanged,
            Self::ToolsUpdated { .. } => EventKind::ToolsUpdated,
            Self::ToolCalled { .. } => EventKind::ToolCalled,
            Self::ConnectionEstablished { .. } => EventKind::ConnectionEstablished,
            Self::ConnectionLost { .. } => EventKind::ConnectionLost,
        }
    }

    /// Server the event concerns, when it concerns exactly one.
    pub fn server_name(&self) -> Option<&str> {
        match self {
            Self::ServerStateChanged { server_name, .. }
            | Self::ServerConfigChanged { server_name, .. }
            | Self::ServerAutoDisabled { server_name, .. }
            | Self::ToolsUpdated { server_name, .. }
            | Self::ToolCalled { server_name, .. }
            | Self::ConnectionEstablished { server_name, .. }
            | Self::ConnectionLost { server_name, .. } => Some(server_name),
            Self::ServerGroupUpdated { .. } | Self::AppStateChanged { .. } => None,
        }
    }
}

/// A timestamped bus event. This is the exact JSON shape sent to WebSocket
/// subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn now(payload: EventPayload) -> Self {
        Self { timestamp: Utc::now(), payload }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}
