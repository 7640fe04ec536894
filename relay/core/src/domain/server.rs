// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Upstream Server Domain Types
//!
//! Domain types for the upstream lifecycle bounded context. The relay acts as
//! a proxy-supervisor — downstream clients never talk to upstream MCP servers
//! directly; every tool call is routed through the relay, and the relay owns
//! each upstream's process and connection lifecycle.
//!
//! ## Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`ServerConfig`] | User-authored, persisted configuration for one upstream |
//! | [`ServerRuntime`] | In-memory runtime record owned by the managed client |
//! | [`StartupMode`] | Mutually-exclusive lifecycle policy (active … auto_disabled) |
//! | [`ConnectionState`] | Six-state connection machine |
//! | [`ToolDescriptor`] | One discovered upstream tool, with stable fingerprint |
//! | [`AppState`] | Derived application-level state |
//!
//! `ServerRuntime.user_stopped` is deliberately runtime-only: it is skipped
//! during serialization and cleared by the storage migration on load, so it
//! can never survive a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::tool::fingerprint;

/// Transport protocol for one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Stdio,
    Http,
    Sse,
    StreamableHttp,
}

impl Protocol {
    /// Network transports maintain a long-lived connection and may demand
    /// interactive OAuth; stdio spawns a local subprocess.
    pub fn is_network(&self) -> bool {
        !matches!(self, Self::Stdio)
    }
}

/// Lifecycle policy for an upstream. Exactly one value at a time — the legacy
/// boolean flags (`enabled`, `quarantined`, `auto_disabled`, `stopped`) are
/// migrated to this enum on load and never written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupMode {
    /// Connect at startup and keep connected.
    Active,
    /// Connect on first tool call.
    LazyLoading,
    /// Never connect until the user re-enables.
    Disabled,
    /// Listed and inspectable, but tools are hidden from search and refused
    /// at dispatch.
    Quarantined,
    /// System-initiated disable after repeated connection failures. Cleared
    /// only by explicit user action.
    AutoDisabled,
}

impl StartupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::LazyLoading => "lazy_loading",
            Self::Disabled => "disabled",
            Self::Quarantined => "quarantined",
            Self::AutoDisabled => "auto_disabled",
        }
    }

    /// Modes under which the relay refuses to route tool calls.
    pub fn refuses_calls(&self) -> bool {
        matches!(self, Self::Disabled | Self::Quarantined | Self::AutoDisabled)
    }

    /// Modes eligible for scheduler / health-loop connection attempts.
    pub fn connects_eagerly(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl Default for StartupMode {
    fn default() -> Self {
        Self::Active
    }
}

/// OAuth hints for a network upstream. Presence implies interactive re-auth
/// may be required; the browser flow itself is an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default)]
    pub scopes: Vec<String>,
}

fn default_auto_disable_threshold() -> u32 {
    5
}

/// User-authored configuration for one upstream MCP server.
///
/// This is the config-file representation (`mcpServers` array entries) and,
/// embedded in [`ServerRecord`](crate::infrastructure::storage::ServerRecord),
/// the record-store representation. The two must agree byte-for-byte on these
/// fields after every completed two-phase write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Unique, stable identity.
    pub name: String,

    pub protocol: Protocol,

    /// Executable for stdio upstreams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    #[serde(default, alias = "working_dir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Endpoint for http / sse / streamable-http upstreams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    #[serde(default, alias = "startup_mode")]
    pub startup_mode: StartupMode,

    #[serde(default = "default_auto_disable_threshold", alias = "auto_disable_threshold")]
    pub auto_disable_threshold: u32,

    /// Human-readable reason, set by the system on auto-disable.
    #[serde(default, alias = "auto_disable_reason", skip_serializing_if = "Option::is_none")]
    pub auto_disable_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,

    /// Last observed tool count. Advisory only — the tool index is the
    /// source of truth once the server is Ready.
    #[serde(default, alias = "tool_count", skip_serializing_if = "Option::is_none")]
    pub tool_count: Option<usize>,

    // Legacy boolean flags, accepted on read (snake_case spellings
    // included) for migration only.
    #[serde(default, skip_serializing)]
    pub(crate) enabled: Option<bool>,
    #[serde(default, skip_serializing)]
    pub(crate) quarantined: Option<bool>,
    #[serde(default, alias = "auto_disabled", skip_serializing)]
    pub(crate) auto_disabled: Option<bool>,
    #[serde(default, skip_serializing)]
    pub(crate) stopped: Option<bool>,
}

impl ServerConfig {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name: name.into(),
            protocol: Protocol::Stdio,
            command: Some(command.into()),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            working_dir: None,
            url: None,
            headers: HashMap::new(),
            startup_mode: StartupMode::Active,
            auto_disable_threshold: default_auto_disable_threshold(),
            auto_disable_reason: None,
            oauth: None,
            tool_count: None,
            enabled: None,
            quarantined: None,
            auto_disabled: None,
            stopped: None,
        }
    }

    pub fn network(name: impl Into<String>, protocol: Protocol, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            url: Some(url.into()),
            headers: HashMap::new(),
            startup_mode: StartupMode::Active,
            auto_disable_threshold: default_auto_disable_threshold(),
            auto_disable_reason: None,
            oauth: None,
            tool_count: None,
            enabled: None,
            quarantined: None,
            auto_disabled: None,
            stopped: None,
        }
    }

    /// Fold any legacy boolean flags into the canonical `startup_mode` and
    /// drop them. The legacy runtime `stopped` flag is always discarded —
    /// user-stop is never persisted state.
    pub fn migrate_legacy_flags(&mut self) {
        if self.quarantined == Some(true) {
            self.startup_mode = StartupMode::Quarantined;
        } else if self.auto_disabled == Some(true) {
            self.startup_mode = StartupMode::AutoDisabled;
        } else if self.enabled == Some(false) {
            self.startup_mode = StartupMode::Disabled;
        }
        self.enabled = None;
        self.quarantined = None;
        self.auto_disabled = None;
        self.stopped = None;
    }

    /// Whether `other` differs in a way that requires tearing down and
    /// re-establishing the transport.
    pub fn transport_changed(&self, other: &ServerConfig) -> bool {
        self.protocol != other.protocol
            || self.command != other.command
            || self.args != other.args
            || self.env != other.env
            || self.working_dir != other.working_dir
            || self.url != other.url
            || self.headers != other.headers
    }

    /// Basic structural validation, surfaced as `invalid_input` upstream.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("server name must not be empty".into());
        }
        match self.protocol {
            Protocol::Stdio => {
                if self.command.as_deref().unwrap_or("").trim().is_empty() {
                    return Err(format!("stdio server '{}' requires a command", self.name));
                }
            }
            _ => {
                if self.url.as_deref().unwrap_or("").trim().is_empty() {
                    return Err(format!(
                        "{} server '{}' requires a url",
                        serde_json::to_string(&self.protocol)
                            .unwrap_or_default()
                            .trim_matches('"'),
                        self.name
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Connection state machine for one upstream.
///
/// ```text
/// Disconnected → Connecting → [Authenticating →] Discovering → Ready
///       ↑                                                        │
///       └───────────── Error ← (any transport failure) ←─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Discovering,
    Ready,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Discovering => "discovering",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

/// One discovered upstream tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-schema text of the argument object.
    pub params_json: String,
    /// `sha256(description ‖ params_json)` — used for drift detection and
    /// index invalidation.
    pub hash: String,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, params_json: impl Into<String>) -> Self {
        let description = description.into();
        let params_json = params_json.into();
        let hash = fingerprint(&description, &params_json);
        Self { name: name.into(), description, params_json, hash }
    }
}

/// In-memory runtime record for one upstream, owned by its managed client.
#[derive(Debug, Clone, Serialize)]
pub struct ServerRuntime {
    pub connection_state: ConnectionState,

    /// The user hit "Stop". Runtime-only: skipped on serialization, cleared
    /// on restart. Must never reach a persisted file.
    #[serde(skip)]
    pub user_stopped: bool,

    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub retry_count: u32,

    pub ever_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_connection: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_connect: Option<Duration>,

    pub tools: Vec<ToolDescriptor>,
}

impl ServerRuntime {
    pub fn new() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            user_stopped: false,
            consecutive_failures: 0,
            first_failure_at: None,
            last_error: None,
            retry_count: 0,
            ever_connected: false,
            last_successful_connection: None,
            time_to_connect: None,
            tools: Vec::new(),
        }
    }

    /// Record a failed attempt to reach Ready.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.consecutive_failures += 1;
        if self.first_failure_at.is_none() {
            self.first_failure_at = Some(Utc::now());
        }
        self.last_error = Some(error.into());
    }

    /// Record a successful entry into Ready, resetting failure accounting.
    pub fn record_success(&mut self, time_to_connect: Duration) {
        self.consecutive_failures = 0;
        self.first_failure_at = None;
        self.last_error = None;
        self.ever_connected = true;
        self.last_successful_connection = Some(Utc::now());
        self.time_to_connect = Some(time_to_connect);
    }
}

impl Default for ServerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Derived application-level state: Degraded whenever at least one
/// non-disabled upstream is not Ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
}

/// Point-in-time status snapshot for one upstream, served by `GetStats` and
/// the `/healthz` surface.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub name: String,
    pub state: ConnectionState,
    pub startup_mode: StartupMode,
    pub connected: bool,
    pub tool_count: usize,
    pub retry_count: u32,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_connect_ms: Option<u64>,
}
