// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Managed Client
//!
//! One [`ManagedClient`] per upstream. It owns the transport, the MCP
//! handshake (`initialize` → `notifications/initialized` → `tools/list`),
//! the six-state connection machine, failure accounting, auto-disable, the
//! OAuth backoff ladder, and user-stop.
//!
//! ## State machine
//!
//! ```text
//! Disconnected → Connecting → [Authenticating →] Discovering → Ready
//!       ↑                                                        │
//!       └── (cleanup) ← Error ← (any transport failure) ←────────┘
//! ```
//!
//! `ServerStateChanged` is emitted on every transition (after persistence,
//! where the transition persists anything), `ConnectionEstablished` on
//! entering Ready, `ConnectionLost` on leaving Ready unexpectedly.
//!
//! Connect, disconnect and the tool-list probe are serialized by a
//! per-client lock; the lazy-loading path and the health loop both funnel
//! through it, so an on-demand connect simply awaits whichever attempt is
//! already in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::error::{RelayError, Result};
use crate::domain::events::EventPayload;
use crate::domain::server::{
    ConnectionState, ServerConfig, ServerRuntime, ServerStats, StartupMode, ToolDescriptor,
};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::logs::LogSink;
use crate::infrastructure::oauth::OAuthBackoff;
use crate::infrastructure::protocol::{self, InitializeResult, ToolsListResult};
use crate::infrastructure::storage::Storage;
use crate::infrastructure::transport::{self, Transport};

/// Window after the first connect attempt during which auto-disable is
/// suppressed, so a slow-starting environment is not punished.
pub const STARTUP_GRACE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub startup_grace: Duration,
    /// Default connect deadline used outside the scheduler (health loop,
    /// lazy-loading).
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            startup_grace: STARTUP_GRACE,
            connect_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
        }
    }
}

pub struct ManagedClient {
    /// Self-reference for detached watcher tasks.
    weak: Weak<ManagedClient>,
    name: String,
    config: RwLock<ServerConfig>,
    runtime: Mutex<ServerRuntime>,
    transport: AsyncMutex<Option<Box<dyn Transport>>>,
    /// Serializes connect / disconnect / probe for this client.
    conn_lock: AsyncMutex<()>,
    bus: EventBus,
    storage: Arc<Storage>,
    log: Arc<LogSink>,
    oauth: Mutex<OAuthBackoff>,
    options: ClientOptions,
    first_attempt_at: Mutex<Option<Instant>>,
    /// Set while an explicit disconnect is tearing the transport down, so
    /// the loss watcher does not also report a ConnectionLost.
    closing: AtomicBool,
    loss_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedClient {
    pub fn new(
        config: ServerConfig,
        bus: EventBus,
        storage: Arc<Storage>,
        log: Arc<LogSink>,
        options: ClientOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            name: config.name.clone(),
            config: RwLock::new(config),
            runtime: Mutex::new(ServerRuntime::new()),
            transport: AsyncMutex::new(None),
            conn_lock: AsyncMutex::new(()),
            bus,
            storage,
            log,
            oauth: Mutex::new(OAuthBackoff::new()),
            options,
            first_attempt_at: Mutex::new(None),
            closing: AtomicBool::new(false),
            loss_watcher: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> ServerConfig {
        self.config.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.runtime.lock().connection_state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn user_stopped(&self) -> bool {
        self.runtime.lock().user_stopped
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.runtime.lock().tools.clone()
    }

    pub fn stats(&self) -> ServerStats {
        let config = self.config.read();
        let runtime = self.runtime.lock();
        ServerStats {
            name: self.name.clone(),
            state: runtime.connection_state,
            startup_mode: config.startup_mode,
            connected: runtime.connection_state == ConnectionState::Ready,
            tool_count: runtime.tools.len(),
            retry_count: runtime.retry_count,
            consecutive_failures: runtime.consecutive_failures,
            last_error: runtime.last_error.clone(),
            time_to_connect_ms: runtime.time_to_connect.map(|d| d.as_millis() as u64),
        }
    }

    pub fn runtime_snapshot(&self) -> ServerRuntime {
        self.runtime.lock().clone()
    }

    /// Whether the scheduler / health loop should attempt a connection now.
    pub fn wants_connection(&self) -> bool {
        let config = self.config.read();
        let runtime = self.runtime.lock();
        config.startup_mode.connects_eagerly()
            && !runtime.user_stopped
            && runtime.connection_state != ConnectionState::Ready
    }

    fn set_state(&self, new_state: ConnectionState, info: Option<String>) {
        let old_state = {
            let mut runtime = self.runtime.lock();
            let old = runtime.connection_state;
            runtime.connection_state = new_state;
            old
        };
        if old_state != new_state {
            self.bus.publish(EventPayload::ServerStateChanged {
                server_name: self.name.clone(),
                old_state,
                new_state,
                info,
            });
        }
    }

    /// Update this client's view of its config. Returns true when the change
    /// affects the transport (the caller should reconnect).
    pub fn reconcile(&self, new_config: ServerConfig) -> bool {
        let mut config = self.config.write();
        let transport_changed = config.transport_changed(&new_config);
        *config = new_config;
        transport_changed
    }

    /// Full connection attempt under `deadline`: transport, handshake,
    /// discovery. Serialized with disconnects and probes.
    pub async fn connect(&self, deadline: Duration) -> Result<()> {
        let _guard = self.conn_lock.lock().await;

        {
            let config = self.config.read();
            match config.startup_mode {
                StartupMode::Disabled => return Err(RelayError::Disabled(self.name.clone())),
                StartupMode::Quarantined => {
                    return Err(RelayError::Quarantined(self.name.clone()))
                }
                StartupMode::AutoDisabled => {
                    return Err(RelayError::AutoDisabled {
                        server: self.name.clone(),
                        reason: config.auto_disable_reason.clone().unwrap_or_default(),
                    })
                }
                StartupMode::Active | StartupMode::LazyLoading => {}
            }
        }
        {
            let runtime = self.runtime.lock();
            if runtime.user_stopped {
                return Err(RelayError::NotConnected(format!(
                    "{} (stopped by user)",
                    self.name
                )));
            }
            if runtime.connection_state == ConnectionState::Ready {
                return Ok(());
            }
        }

        // OAuth cooldown is checked before any transport work; an ordinary
        // reconnect never consumes a backoff slot.
        if let Some(remaining) = self.oauth.lock().cooldown_remaining() {
            return Err(RelayError::OAuthBackoff { server: self.name.clone(), remaining });
        }

        {
            let mut first = self.first_attempt_at.lock();
            if first.is_none() {
                *first = Some(Instant::now());
            } else {
                self.runtime.lock().retry_count += 1;
            }
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(deadline, self.establish()).await;
        let outcome = match outcome {
            Ok(result) => result,
            Err(_) => Err(RelayError::DeadlineExceeded),
        };

        match outcome {
            Ok(tool_count) => {
                let elapsed = started.elapsed();
                // Persist the durable success markers before announcing Ready.
                if let Err(err) = self.storage.record_connection_success(&self.name) {
                    warn!(server = %self.name, %err, "failed to persist connection success");
                }
                self.runtime.lock().record_success(elapsed);
                self.set_state(ConnectionState::Ready, None);
                self.bus.publish(EventPayload::ConnectionEstablished {
                    server_name: self.name.clone(),
                    time_to_connect_ms: elapsed.as_millis() as u64,
                });
                self.bus.publish(EventPayload::ToolsUpdated {
                    server_name: self.name.clone(),
                    tool_count,
                });
                self.spawn_loss_watcher().await;
                info!(server = %self.name, tools = tool_count, ms = elapsed.as_millis() as u64, "upstream ready");
                Ok(())
            }
            Err(err) => {
                let message = match &err {
                    RelayError::DeadlineExceeded => "deadline exceeded".to_string(),
                    other => other.to_string(),
                };
                self.teardown_transport().await;
                self.runtime.lock().record_failure(message.clone());
                self.log.record_failure(&self.name, &message);
                self.set_state(ConnectionState::Error, Some(message));
                // Error → Disconnected after cleanup.
                self.set_state(ConnectionState::Disconnected, None);
                self.maybe_auto_disable().await;
                Err(err)
            }
        }
    }

    /// Transport bring-up, handshake and discovery. Runs under the connect
    /// deadline; returns the discovered tool count.
    async fn establish(&self) -> Result<usize> {
        let config = self.config();
        self.set_state(ConnectionState::Connecting, None);

        let transport = match transport::connect(&config, Arc::clone(&self.log)).await {
            Ok(transport) => transport,
            Err(RelayError::OAuthRequired(server)) => {
                // Network transport demanded OAuth. The interactive flow is
                // an external collaborator; all the relay does here is enter
                // the backoff ladder.
                self.set_state(ConnectionState::Authenticating, None);
                self.oauth.lock().record_failure();
                return Err(RelayError::OAuthRequired(server));
            }
            Err(err) => return Err(err),
        };

        let init_value = transport
            .request("initialize", protocol::initialize_params("aegis-relay"))
            .await?;
        let init: InitializeResult = serde_json::from_value(init_value)
            .map_err(|e| RelayError::Transport(format!("invalid initialize result: {e}")))?;
        debug!(
            server = %self.name,
            version = %init.protocol_version,
            peer = init.server_info.as_ref().map(|s| s.name.as_str()).unwrap_or("unknown"),
            "handshake complete"
        );
        transport
            .notify("notifications/initialized", serde_json::json!({}))
            .await?;

        self.set_state(ConnectionState::Discovering, None);
        let tools_value = transport.request("tools/list", serde_json::json!({})).await?;
        let listed: ToolsListResult = serde_json::from_value(tools_value)
            .map_err(|e| RelayError::Transport(format!("invalid tools/list result: {e}")))?;

        let tools: Vec<ToolDescriptor> = listed
            .tools
            .into_iter()
            .map(|t| {
                let params = t
                    .input_schema
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                ToolDescriptor::new(t.name, t.description.unwrap_or_default(), params)
            })
            .collect();
        let count = tools.len();
        self.runtime.lock().tools = tools;

        *self.transport.lock().await = Some(transport);
        Ok(count)
    }

    /// Watch the live transport for unexpected death and report it.
    async fn spawn_loss_watcher(&self) {
        let closed = match self.transport.lock().await.as_ref() {
            Some(transport) => transport.closed(),
            None => return,
        };
        let weak = self.weak.clone();
        let handle = tokio::spawn(async move {
            closed.cancelled().await;
            let Some(client) = weak.upgrade() else { return };
            if client.closing.load(Ordering::SeqCst) {
                return;
            }
            if client.state() == ConnectionState::Ready {
                client.handle_connection_lost("transport closed").await;
            }
        });
        if let Some(previous) = self.loss_watcher.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn handle_connection_lost(&self, reason: &str) {
        let _guard = self.conn_lock.lock().await;
        if self.state() != ConnectionState::Ready {
            return;
        }
        warn!(server = %self.name, reason, "connection lost");
        self.teardown_transport().await;
        self.runtime.lock().tools.clear();
        self.set_state(ConnectionState::Disconnected, Some(reason.to_string()));
        self.bus.publish(EventPayload::ConnectionLost {
            server_name: self.name.clone(),
            reason: Some(reason.to_string()),
        });
    }

    async fn teardown_transport(&self) {
        if let Some(transport) = self.transport.lock().await.take() {
            transport.close().await;
        }
    }

    /// Explicit disconnect (user stop, removal, reconcile, shutdown).
    /// Cooperatively interrupts nothing that is not ours: a pending connect
    /// finishes first because both paths hold the connection lock.
    pub async fn disconnect(&self) {
        let _guard = self.conn_lock.lock().await;
        self.closing.store(true, Ordering::SeqCst);
        if let Some(watcher) = self.loss_watcher.lock().take() {
            watcher.abort();
        }
        self.teardown_transport().await;
        {
            let mut runtime = self.runtime.lock();
            runtime.tools.clear();
        }
        self.set_state(ConnectionState::Disconnected, None);
        self.closing.store(false, Ordering::SeqCst);
    }

    /// Soft "do not connect" toggled from the UI. Never persisted and never
    /// touches `startup_mode`.
    pub async fn set_user_stopped(&self, stopped: bool) {
        self.runtime.lock().user_stopped = stopped;
        if stopped {
            self.disconnect().await;
        }
    }

    /// Routed tool invocation. Policy checks live in the manager; this is
    /// the transport leg only.
    pub async fn call_tool(&self, tool: &str, arguments: Value, deadline: Duration) -> Result<Value> {
        if self.state() != ConnectionState::Ready {
            return Err(RelayError::NotConnected(self.name.clone()));
        }
        let guard = self.transport.lock().await;
        let transport = guard
            .as_ref()
            .ok_or_else(|| RelayError::NotConnected(self.name.clone()))?;
        match tokio::time::timeout(
            deadline,
            transport.request("tools/call", protocol::call_tool_params(tool, arguments)),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RelayError::DeadlineExceeded),
        }
    }

    /// Lightweight functional probe: a `tools/list` whose success confirms
    /// the upstream actually answers requests, not merely that the socket or
    /// process is alive. Refreshes the cached tool set on drift.
    pub async fn probe(&self, deadline: Duration) -> Result<bool> {
        if self.state() != ConnectionState::Ready {
            return Err(RelayError::NotConnected(self.name.clone()));
        }
        let result = {
            let guard = self.transport.lock().await;
            let transport = guard
                .as_ref()
                .ok_or_else(|| RelayError::NotConnected(self.name.clone()))?;
            tokio::time::timeout(deadline, transport.request("tools/list", serde_json::json!({})))
                .await
        };
        let value = match result {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                self.handle_connection_lost(&format!("probe failed: {err}")).await;
                return Err(err);
            }
            Err(_) => {
                self.handle_connection_lost("probe deadline exceeded").await;
                return Err(RelayError::DeadlineExceeded);
            }
        };

        let listed: ToolsListResult = serde_json::from_value(value)
            .map_err(|e| RelayError::Transport(format!("invalid tools/list result: {e}")))?;
        let fresh: Vec<ToolDescriptor> = listed
            .tools
            .into_iter()
            .map(|t| {
                let params = t
                    .input_schema
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                ToolDescriptor::new(t.name, t.description.unwrap_or_default(), params)
            })
            .collect();

        let drifted = {
            let mut runtime = self.runtime.lock();
            let drifted = runtime.tools != fresh;
            if drifted {
                runtime.tools = fresh;
            }
            drifted
        };
        if drifted {
            let count = self.runtime.lock().tools.len();
            self.bus.publish(EventPayload::ToolsUpdated {
                server_name: self.name.clone(),
                tool_count: count,
            });
        }
        Ok(drifted)
    }

    /// User-initiated login resets the OAuth ladder so the next connect may
    /// attempt interactive auth immediately.
    pub fn reset_oauth(&self) {
        self.oauth.lock().reset();
    }

    /// Explicit user re-enable starts a fresh failure streak; without this a
    /// single new failure would re-trip auto-disable off the stale counters.
    pub fn reset_failure_accounting(&self) {
        let mut runtime = self.runtime.lock();
        runtime.consecutive_failures = 0;
        runtime.first_failure_at = None;
        runtime.last_error = None;
    }

    /// Trip auto-disable when the failure streak crosses the threshold and
    /// the startup grace window has passed.
    async fn maybe_auto_disable(&self) {
        let (threshold, failures, last_error) = {
            let config = self.config.read();
            let runtime = self.runtime.lock();
            (
                config.auto_disable_threshold,
                runtime.consecutive_failures,
                runtime.last_error.clone().unwrap_or_default(),
            )
        };
        if threshold == 0 || failures < threshold {
            return;
        }
        let within_grace = self
            .first_attempt_at
            .lock()
            .map(|t| t.elapsed() < self.options.startup_grace)
            .unwrap_or(true);
        if within_grace {
            return;
        }

        let reason = format!("auto-disabled after {failures} consecutive failures: {last_error}");
        match self.storage.set_startup_mode(&self.name, StartupMode::AutoDisabled, Some(reason.clone())) {
            Ok(()) => {
                {
                    let mut config = self.config.write();
                    config.startup_mode = StartupMode::AutoDisabled;
                    config.auto_disable_reason = Some(reason.clone());
                }
                warn!(server = %self.name, failures, "upstream auto-disabled");
                self.log.record_failure(&self.name, &reason);
                self.bus.publish(EventPayload::ServerAutoDisabled {
                    server_name: self.name.clone(),
                    reason,
                    consecutive_failures: failures,
                });
            }
            Err(err) => {
                warn!(server = %self.name, %err, "failed to persist auto-disable");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::EventKind;
    use crate::infrastructure::storage::Storage;

    fn fixture(config: ServerConfig, options: ClientOptions) -> (Arc<ManagedClient>, EventBus, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let storage = Arc::new(
            Storage::open(dir.path(), &dir.path().join("config.json"), bus.clone()).unwrap(),
        );
        storage.save_server(config.clone()).unwrap();
        let log = Arc::new(LogSink::open(&dir.path().join("logs")).unwrap());
        let client = ManagedClient::new(config, bus.clone(), storage, log, options);
        (client, bus, dir)
    }

    #[tokio::test]
    async fn failed_connect_counts_and_surfaces_error() {
        let config = ServerConfig::stdio("broken", "false", &[]);
        let (client, _bus, _dir) = fixture(config, ClientOptions::default());

        let err = client.connect(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_) | RelayError::DeadlineExceeded));

        let runtime = client.runtime_snapshot();
        assert_eq!(runtime.consecutive_failures, 1);
        assert!(runtime.first_failure_at.is_some());
        assert!(runtime.last_error.is_some());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn auto_disable_respects_grace_window() {
        let mut config = ServerConfig::stdio("flappy", "false", &[]);
        config.auto_disable_threshold = 2;
        let (client, bus, _dir) = fixture(config, ClientOptions::default());
        let mut sub = bus.subscribe(&[EventKind::ServerAutoDisabled]);

        // Failures inside the 2-minute grace window never trip, even past
        // the threshold.
        for _ in 0..4 {
            let _ = client.connect(Duration::from_secs(5)).await;
        }
        assert!(sub.try_recv().is_none());
        assert_eq!(client.config().startup_mode, StartupMode::Active);
    }

    #[tokio::test]
    async fn auto_disable_trips_past_grace_and_blocks_reconnect() {
        let mut config = ServerConfig::stdio("flappy", "false", &[]);
        config.auto_disable_threshold = 3;
        let options = ClientOptions { startup_grace: Duration::from_millis(50), ..Default::default() };
        let (client, bus, _dir) = fixture(config, options);
        let mut sub = bus.subscribe(&[EventKind::ServerAutoDisabled]);

        let _ = client.connect(Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        let _ = client.connect(Duration::from_secs(5)).await;
        let _ = client.connect(Duration::from_secs(5)).await;

        let event = sub.recv().await.unwrap();
        match event.payload {
            EventPayload::ServerAutoDisabled { reason, consecutive_failures, .. } => {
                assert!(reason.contains('3'));
                assert_eq!(consecutive_failures, 3);
            }
            other => panic!("expected ServerAutoDisabled, got {other:?}"),
        }
        assert_eq!(client.config().startup_mode, StartupMode::AutoDisabled);

        // Further attempts refuse without touching the transport.
        let err = client.connect(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RelayError::AutoDisabled { .. }));
    }

    #[tokio::test]
    async fn user_stop_blocks_connects_without_mode_change() {
        let config = ServerConfig::stdio("s", "false", &[]);
        let (client, _bus, _dir) = fixture(config, ClientOptions::default());

        client.set_user_stopped(true).await;
        assert!(client.user_stopped());
        assert_eq!(client.config().startup_mode, StartupMode::Active);
        assert!(!client.wants_connection());

        let err = client.connect(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RelayError::NotConnected(_)));
        // No failure accounting for a refusal.
        assert_eq!(client.runtime_snapshot().consecutive_failures, 0);

        client.set_user_stopped(false).await;
        assert!(client.wants_connection());
    }

    #[tokio::test]
    async fn call_tool_on_disconnected_client_is_not_connected() {
        let config = ServerConfig::stdio("s", "false", &[]);
        let (client, _bus, _dir) = fixture(config, ClientOptions::default());
        let err = client
            .call_tool("anything", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotConnected(_)));
    }

    #[tokio::test]
    async fn quarantined_client_refuses_connect() {
        let mut config = ServerConfig::stdio("dangerous", "false", &[]);
        config.startup_mode = StartupMode::Quarantined;
        let (client, _bus, _dir) = fixture(config, ClientOptions::default());
        let err = client.connect(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RelayError::Quarantined(_)));
        assert!(!client.wants_connection());
    }

    #[tokio::test]
    async fn deadline_exceeded_sets_specific_error() {
        // `sleep 30` accepts stdin but never speaks MCP.
        let config = ServerConfig::stdio("slow", "sleep", &["30"]);
        let (client, _bus, _dir) = fixture(config, ClientOptions::default());

        let err = client.connect(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, RelayError::DeadlineExceeded));
        let runtime = client.runtime_snapshot();
        assert_eq!(runtime.last_error.as_deref(), Some("deadline exceeded"));
    }

    #[tokio::test]
    async fn retry_count_tracks_repeat_attempts() {
        let config = ServerConfig::stdio("s", "false", &[]);
        let (client, _bus, _dir) = fixture(config, ClientOptions::default());
        let _ = client.connect(Duration::from_secs(5)).await;
        let _ = client.connect(Duration::from_secs(5)).await;
        let _ = client.connect(Duration::from_secs(5)).await;
        assert_eq!(client.runtime_snapshot().retry_count, 2);
    }
}
