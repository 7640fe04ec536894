// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Upstream Manager
//!
//! Registry of managed clients plus the routed operations the MCP facade
//! consumes: add/remove/update, tool discovery, `call_tool` dispatch, stats,
//! the health monitor and the auto-recovery scan.
//!
//! The manager never hands itself to clients. Clients publish to the bus;
//! the manager subscribes and maintains the tool index and derived
//! application state from the event stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::config::RelayConfig;
use crate::domain::error::{RelayError, Result};
use crate::domain::events::{EventKind, EventPayload};
use crate::domain::server::{
    AppState, ConnectionState, ServerConfig, ServerStats, StartupMode, ToolDescriptor,
};
use crate::domain::tool::ToolEntry;
use crate::infrastructure::client::{ClientOptions, ManagedClient};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::index::ToolIndex;
use crate::infrastructure::logs::LogSink;
use crate::infrastructure::scheduler::{self, SchedulerOptions, WaveReport};
use crate::infrastructure::storage::Storage;

/// Graceful half of the shutdown budget; after this the remaining transports
/// are dropped hard.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(7);

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub scheduler: SchedulerOptions,
    pub client: ClientOptions,
    pub health_interval: Duration,
    pub probe_interval: Duration,
    /// Auto-disabled servers older than this are surfaced as recovery
    /// candidates (re-enabling stays an explicit user action).
    pub recovery_window: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            scheduler: SchedulerOptions::default(),
            client: ClientOptions::default(),
            health_interval: Duration::from_secs(5),
            probe_interval: Duration::from_secs(60),
            recovery_window: Duration::from_secs(30 * 60),
        }
    }
}

impl ManagerOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            scheduler: SchedulerOptions {
                max_workers: config.max_concurrent_connections,
                ..SchedulerOptions::default()
            },
            client: ClientOptions {
                call_timeout: config.call_tool_timeout,
                ..ClientOptions::default()
            },
            health_interval: config.health_check_interval,
            probe_interval: config.probe_interval,
            ..Self::default()
        }
    }
}

/// Config + runtime snapshot for one upstream, served by `upstream_servers`
/// and `/healthz`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerView {
    #[serde(flatten)]
    pub config: ServerConfig,
    pub stats: ServerStats,
    pub ever_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_connection: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct UpstreamManager {
    /// Self-reference for the detached maintenance loops.
    weak: std::sync::Weak<UpstreamManager>,
    clients: RwLock<HashMap<String, Arc<ManagedClient>>>,
    bus: EventBus,
    storage: Arc<Storage>,
    index: Arc<ToolIndex>,
    log: Arc<LogSink>,
    options: ManagerOptions,
    cancel: CancellationToken,
    app_state: parking_lot::Mutex<AppState>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl UpstreamManager {
    pub fn new(
        bus: EventBus,
        storage: Arc<Storage>,
        index: Arc<ToolIndex>,
        log: Arc<LogSink>,
        options: ManagerOptions,
    ) -> Result<Arc<Self>> {
        let mut clients = HashMap::new();
        for record in storage.list_servers()? {
            let config = record.config.clone();
            if config.startup_mode == StartupMode::Quarantined {
                index.set_quarantined(&config.name, true);
            }
            let client = ManagedClient::new(
                config.clone(),
                bus.clone(),
                Arc::clone(&storage),
                Arc::clone(&log),
                options.client.clone(),
            );
            clients.insert(config.name, client);
        }

        Ok(Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            clients: RwLock::new(clients),
            bus,
            storage,
            index,
            log,
            options,
            cancel: CancellationToken::new(),
            app_state: parking_lot::Mutex::new(AppState::Starting),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn index(&self) -> Arc<ToolIndex> {
        Arc::clone(&self.index)
    }

    pub fn log(&self) -> Arc<LogSink> {
        Arc::clone(&self.log)
    }

    pub fn storage(&self) -> Arc<Storage> {
        Arc::clone(&self.storage)
    }

    pub fn app_state(&self) -> AppState {
        *self.app_state.lock()
    }

    /// Start the long-lived loops and run the initial connection waves.
    /// Returns once the waves have drained.
    pub async fn start(&self) -> WaveReport {
        self.spawn_bus_listener();
        self.spawn_health_loop();
        self.spawn_recovery_loop();

        let eligible: Vec<Arc<ManagedClient>> = {
            let clients = self.clients.read().await;
            clients.values().filter(|c| c.wants_connection()).cloned().collect()
        };
        info!(eligible = eligible.len(), "starting initial connection waves");
        let report = scheduler::run(eligible, &self.options.scheduler).await;
        self.recompute_app_state().await;
        report
    }

    /// Index maintenance and derived state, driven purely off the bus.
    fn spawn_bus_listener(&self) {
        let mut sub = self.bus.subscribe(&[
            EventKind::ServerStateChanged,
            EventKind::ToolsUpdated,
            EventKind::ConnectionLost,
        ]);
        let weak = self.weak.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = sub.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(manager) = weak.upgrade() else { break };
                match &event.payload {
                    EventPayload::ToolsUpdated { server_name, .. } => {
                        manager.reindex_server(server_name).await;
                    }
                    EventPayload::ServerStateChanged { server_name, old_state, new_state, .. } => {
                        if *old_state == ConnectionState::Ready && *new_state != ConnectionState::Ready
                        {
                            manager.index.delete_server_tools(server_name);
                            manager.index.set_connected(server_name, false);
                        }
                        manager.recompute_app_state().await;
                    }
                    EventPayload::ConnectionLost { server_name, .. } => {
                        manager.index.delete_server_tools(server_name);
                        manager.index.set_connected(server_name, false);
                        manager.recompute_app_state().await;
                    }
                    _ => {}
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn reindex_server(&self, server: &str) {
        let Some(client) = self.client(server).await else { return };
        let entries: Vec<ToolEntry> = client
            .tools()
            .into_iter()
            .map(|t: ToolDescriptor| ToolEntry::new(server, t.name, t.description, t.params_json))
            .collect();
        let count = entries.len();
        // Stale entries from the previous discovery go first.
        self.index.delete_server_tools(server);
        if let Err(err) = self.index.batch_index(entries).await {
            warn!(server, %err, "tool indexing failed");
            return;
        }
        self.index.set_connected(server, true);
        debug!(server, count, "tools indexed");

        // Refresh the advisory tool-count cache through the two-phase path
        // so both persistent surfaces stay in agreement.
        let mut config = client.config();
        if config.tool_count != Some(count) {
            config.tool_count = Some(count);
            client.reconcile(config.clone());
            if let Err(err) = self.storage.save_server(config) {
                warn!(server, %err, "failed to persist tool count");
            }
        }
    }

    fn spawn_health_loop(&self) {
        let weak = self.weak.clone();
        let cancel = self.cancel.clone();
        let health_interval = self.options.health_interval;
        let probe_interval = self.options.probe_interval;
        let connect_timeout = self.options.client.connect_timeout;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_probe: HashMap<String, Instant> = HashMap::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = weak.upgrade() else { break };
                let clients: Vec<Arc<ManagedClient>> = {
                    let map = manager.clients.read().await;
                    map.values().cloned().collect()
                };
                for client in clients {
                    if client.wants_connection() {
                        let client = Arc::clone(&client);
                        tokio::spawn(async move {
                            // The per-client lock makes overlapping ticks a
                            // no-op rather than a stampede.
                            let _ = client.connect(connect_timeout).await;
                        });
                    } else if client.is_connected() {
                        let due = last_probe
                            .get(client.name())
                            .map(|t| t.elapsed() >= probe_interval)
                            .unwrap_or(true);
                        if due {
                            last_probe.insert(client.name().to_string(), Instant::now());
                            let client = Arc::clone(&client);
                            tokio::spawn(async move {
                                let _ = client.probe(Duration::from_secs(10)).await;
                            });
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Surfaces auto-disabled servers whose failure is old enough to be
    /// worth another look. Never re-enables by itself.
    fn spawn_recovery_loop(&self) {
        let weak = self.weak.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = weak.upgrade() else { break };
                let candidates = manager.recovery_candidates().await;
                if !candidates.is_empty() {
                    info!(
                        servers = ?candidates,
                        "auto-disabled servers eligible for user re-enable"
                    );
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Auto-disabled servers whose last failure is older than the recovery
    /// window.
    pub async fn recovery_candidates(&self) -> Vec<String> {
        let clients = self.clients.read().await;
        let mut out = Vec::new();
        for (name, client) in clients.iter() {
            if client.config().startup_mode != StartupMode::AutoDisabled {
                continue;
            }
            let runtime = client.runtime_snapshot();
            let old_enough = runtime
                .first_failure_at
                .map(|t| chrono::Utc::now() - t > chrono::Duration::from_std(self.options.recovery_window).unwrap_or_default())
                .unwrap_or(true);
            if old_enough {
                out.push(name.clone());
            }
        }
        out.sort();
        out
    }

    pub async fn client(&self, name: &str) -> Option<Arc<ManagedClient>> {
        self.clients.read().await.get(name).cloned()
    }

    async fn client_or_not_found(&self, name: &str) -> Result<Arc<ManagedClient>> {
        self.client(name)
            .await
            .ok_or_else(|| RelayError::NotFound(name.to_string()))
    }

    /// Idempotent insert/update. A transport-affecting change tears the old
    /// connection down; reconnection is the health loop's job.
    pub async fn add_or_update_server(&self, config: ServerConfig) -> Result<()> {
        config.validate().map_err(RelayError::InvalidInput)?;
        self.storage.save_server(config.clone())?;
        self.index
            .set_quarantined(&config.name, config.startup_mode == StartupMode::Quarantined);

        let existing = self.client(&config.name).await;
        match existing {
            Some(client) => {
                let transport_changed = client.reconcile(config.clone());
                if transport_changed && client.is_connected() {
                    info!(server = %config.name, "transport config changed; reconnecting");
                    client.disconnect().await;
                }
            }
            None => {
                let client = ManagedClient::new(
                    config.clone(),
                    self.bus.clone(),
                    Arc::clone(&self.storage),
                    Arc::clone(&self.log),
                    self.options.client.clone(),
                );
                self.clients.write().await.insert(config.name.clone(), client);
            }
        }
        Ok(())
    }

    /// Disconnect, forget and scrub the index.
    pub async fn remove_server(&self, name: &str) -> Result<()> {
        let client = self.client_or_not_found(name).await?;
        self.storage.delete_server(name)?;
        client.disconnect().await;
        self.clients.write().await.remove(name);
        self.index.delete_server_tools(name);
        self.index.set_quarantined(name, false);
        Ok(())
    }

    pub async fn list_servers(&self) -> Result<Vec<ServerView>> {
        let records = self.storage.list_servers()?;
        let clients = self.clients.read().await;
        Ok(records
            .into_iter()
            .map(|record| {
                let stats = clients
                    .get(record.name())
                    .map(|c| c.stats())
                    .unwrap_or_else(|| ServerStats {
                        name: record.name().to_string(),
                        state: ConnectionState::Disconnected,
                        startup_mode: record.config.startup_mode,
                        connected: false,
                        tool_count: 0,
                        retry_count: 0,
                        consecutive_failures: 0,
                        last_error: None,
                        time_to_connect_ms: None,
                    });
                ServerView {
                    config: record.config,
                    stats,
                    ever_connected: record.ever_connected,
                    last_successful_connection: record.last_successful_connection,
                }
            })
            .collect())
    }

    pub async fn get_stats(&self) -> HashMap<String, ServerStats> {
        let clients = self.clients.read().await;
        clients.iter().map(|(name, c)| (name.clone(), c.stats())).collect()
    }

    /// Cached tool list for one server.
    pub async fn list_tools(&self, name: &str) -> Result<Vec<ToolDescriptor>> {
        let client = self.client_or_not_found(name).await?;
        if !client.is_connected() {
            return Err(RelayError::NotConnected(name.to_string()));
        }
        Ok(client.tools())
    }

    /// Routed tool invocation with the full policy gauntlet.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let client = self.client_or_not_found(server).await?;
        let config = client.config();

        match config.startup_mode {
            StartupMode::Disabled => return Err(RelayError::Disabled(server.to_string())),
            StartupMode::Quarantined => return Err(RelayError::Quarantined(server.to_string())),
            StartupMode::AutoDisabled => {
                return Err(RelayError::AutoDisabled {
                    server: server.to_string(),
                    reason: config.auto_disable_reason.unwrap_or_default(),
                })
            }
            StartupMode::Active | StartupMode::LazyLoading => {}
        }

        // A user-stopped server refuses calls until explicitly restarted; a
        // tool call never clears the stop.
        if client.user_stopped() {
            return Err(RelayError::NotConnected(format!("{server} (stopped by user)")));
        }

        if !client.is_connected() && config.startup_mode == StartupMode::LazyLoading {
            debug!(server, "lazy-loading connect on demand");
            client.connect(self.options.client.connect_timeout).await?;
        }

        let deadline = timeout.unwrap_or(self.options.client.call_timeout);
        let started = Instant::now();
        let result = client.call_tool(tool, arguments, deadline).await;
        let duration = started.elapsed();

        self.bus.publish(EventPayload::ToolCalled {
            server_name: server.to_string(),
            tool_name: tool.to_string(),
            duration_ms: duration.as_millis() as u64,
            success: result.is_ok(),
        });
        metrics::histogram!("relay_call_tool_duration_ms").record(duration.as_millis() as f64);
        if result.is_err() {
            metrics::counter!("relay_call_tool_failures").increment(1);
        }
        result
    }

    pub async fn enable_server(&self, name: &str, enabled: bool) -> Result<()> {
        let client = self.client_or_not_found(name).await?;
        self.storage.enable_server(name, enabled)?;
        let record = self
            .storage
            .get_server(name)?
            .ok_or_else(|| RelayError::NotFound(name.to_string()))?;
        client.reconcile(record.config.clone());
        self.index.set_quarantined(name, record.config.startup_mode == StartupMode::Quarantined);
        if enabled {
            client.reset_failure_accounting();
        } else {
            client.disconnect().await;
        }
        Ok(())
    }

    pub async fn set_quarantined(&self, name: &str, quarantined: bool) -> Result<()> {
        let client = self.client_or_not_found(name).await?;
        let mode = if quarantined { StartupMode::Quarantined } else { StartupMode::Active };
        self.storage.set_startup_mode(name, mode, None)?;
        let record = self
            .storage
            .get_server(name)?
            .ok_or_else(|| RelayError::NotFound(name.to_string()))?;
        client.reconcile(record.config);
        self.index.set_quarantined(name, quarantined);
        if quarantined {
            client.disconnect().await;
            self.index.delete_server_tools(name);
        }
        Ok(())
    }

    pub async fn set_user_stopped(&self, name: &str, stopped: bool) -> Result<()> {
        let client = self.client_or_not_found(name).await?;
        client.set_user_stopped(stopped).await;
        Ok(())
    }

    /// Bulk startup-mode flip for a user-defined group.
    pub async fn set_group_enabled(&self, group: &str, enabled: bool) -> Result<Vec<String>> {
        let members = self
            .storage
            .groups()
            .get(group)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(format!("group '{group}'")))?;
        for name in &members {
            self.enable_server(name, enabled).await?;
        }
        Ok(members)
    }

    async fn recompute_app_state(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let clients = self.clients.read().await;
        let mut degraded = false;
        for client in clients.values() {
            let config = client.config();
            if config.startup_mode == StartupMode::Active
                && !client.user_stopped()
                && !client.is_connected()
            {
                degraded = true;
                break;
            }
        }
        drop(clients);

        let new_state = if degraded { AppState::Degraded } else { AppState::Running };
        let old_state = {
            let mut current = self.app_state.lock();
            let old = *current;
            if old == AppState::Stopping || old == AppState::Stopped {
                return;
            }
            *current = new_state;
            old
        };
        if old_state != new_state {
            self.bus.publish(EventPayload::AppStateChanged { old_state, new_state });
        }
    }

    /// Two-phase shutdown: cancel loops, then disconnect every client within
    /// the graceful budget; whatever is left is dropped hard.
    pub async fn shutdown(&self) {
        {
            let mut state = self.app_state.lock();
            let old = *state;
            *state = AppState::Stopping;
            self.bus.publish(EventPayload::AppStateChanged {
                old_state: old,
                new_state: AppState::Stopping,
            });
        }
        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let clients: Vec<Arc<ManagedClient>> = {
            let map = self.clients.read().await;
            map.values().cloned().collect()
        };
        let disconnects = futures::future::join_all(
            clients.iter().map(|client| client.disconnect()),
        );
        if tokio::time::timeout(SHUTDOWN_GRACE, disconnects).await.is_err() {
            warn!("graceful disconnect budget exceeded; forcing shutdown");
        }

        {
            let mut state = self.app_state.lock();
            *state = AppState::Stopped;
            self.bus.publish(EventPayload::AppStateChanged {
                old_state: AppState::Stopping,
                new_state: AppState::Stopped,
            });
        }
    }
}
