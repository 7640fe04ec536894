// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Composition root: wires storage, bus, index, manager, facade and the
//! HTTP surface together. There is no global mutable state anywhere in the
//! core — everything is created here, once per process, and handed down
//! explicitly; tests build their own smaller assemblies.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::cache::ResultCache;
use crate::application::facade::RelayFacade;
use crate::application::registry::RegistrySet;
use crate::domain::config::RelayConfig;
use crate::domain::error::{RelayError, Result};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::index::embed::{Embedder, HashEmbedder, HttpEmbedder};
use crate::infrastructure::index::ToolIndex;
use crate::infrastructure::logs::LogSink;
use crate::infrastructure::manager::{ManagerOptions, UpstreamManager};
use crate::infrastructure::scheduler::WaveReport;
use crate::infrastructure::storage::Storage;
use crate::presentation::http;

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    /// Overrides the `listen` address from the config file when set.
    pub listen: Option<String>,
}

impl RuntimeOptions {
    /// Platform-default locations under the user's data directory.
    pub fn discover() -> Result<Self> {
        let base = dirs::data_dir()
            .ok_or_else(|| RelayError::Fatal("no platform data directory".into()))?
            .join("aegis-relay");
        Ok(Self {
            config_path: base.join("config.json"),
            data_dir: base,
            listen: None,
        })
    }
}

pub struct RelayRuntime {
    bus: EventBus,
    manager: Arc<UpstreamManager>,
    facade: Arc<RelayFacade>,
    config: RelayConfig,
    /// Cancels the HTTP/WebSocket surface (first in shutdown order).
    http_cancel: CancellationToken,
    http_task: Option<tokio::task::JoinHandle<()>>,
}

impl RelayRuntime {
    /// Build the full assembly, bind the HTTP surface and run the initial
    /// connection waves. Returns once the waves have drained.
    pub async fn start(options: RuntimeOptions) -> Result<(Self, WaveReport)> {
        std::fs::create_dir_all(&options.data_dir).map_err(RelayError::persistence)?;

        let bus = EventBus::new();
        let storage = Arc::new(Storage::open(
            &options.data_dir,
            &options.config_path,
            bus.clone(),
        )?);
        let config = storage.config();

        let semantic = &config.semantic_search;
        let embedder: Option<Arc<dyn Embedder>> = if semantic.enabled {
            match &semantic.endpoint {
                Some(endpoint) => {
                    let model = semantic.model.clone().unwrap_or_else(|| "all-minilm".to_string());
                    Some(Arc::new(HttpEmbedder::new(endpoint.clone(), model)?))
                }
                None => Some(Arc::new(HashEmbedder::new())),
            }
        } else {
            None
        };
        let sidecar = semantic
            .enabled
            .then(|| options.data_dir.join("semantic_index.json"));
        let index = Arc::new(ToolIndex::new(
            embedder,
            sidecar,
            semantic.weight,
            semantic.min_similarity,
        ));

        let log = Arc::new(LogSink::open(&options.data_dir.join("logs"))?);
        let manager = UpstreamManager::new(
            bus.clone(),
            storage,
            Arc::clone(&index),
            log,
            ManagerOptions::from_config(&config),
        )?;

        let facade = Arc::new(RelayFacade::new(
            Arc::clone(&manager),
            ResultCache::default(),
            RegistrySet::new(),
            config.tools_limit,
        ));

        let listen = options.listen.clone().unwrap_or_else(|| config.listen.clone());
        let http_cancel = CancellationToken::new();
        let router = http::app(bus.clone(), Arc::clone(&manager));
        let http_task = {
            let cancel = http_cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = http::serve(&listen, router, cancel).await {
                    warn!(%err, "http surface exited");
                }
            })
        };

        let report = manager.start().await;
        info!(
            total = report.total,
            successful = report.successful,
            "relay runtime started"
        );

        Ok((
            Self {
                bus,
                manager,
                facade,
                config,
                http_cancel,
                http_task: Some(http_task),
            },
            report,
        ))
    }

    pub fn facade(&self) -> Arc<RelayFacade> {
        Arc::clone(&self.facade)
    }

    pub fn manager(&self) -> Arc<UpstreamManager> {
        Arc::clone(&self.manager)
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Reverse-dependency-order shutdown: broadcaster first, then manager
    /// loops / scheduler / clients, then the bus. Storage flushes on drop.
    pub async fn shutdown(mut self) {
        self.http_cancel.cancel();
        if let Some(task) = self.http_task.take() {
            let _ = task.await;
        }
        self.manager.shutdown().await;
        self.bus.shutdown();
        info!("relay runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_and_shutdown_with_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let options = RuntimeOptions {
            data_dir: dir.path().to_path_buf(),
            config_path: dir.path().join("config.json"),
            listen: Some("127.0.0.1:0".to_string()),
        };
        let (runtime, report) = RelayRuntime::start(options).await.unwrap();
        assert_eq!(report.total, 0);
        runtime.shutdown().await;
    }
}
