// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared fixtures for the scenario tests: a scripted stdio MCP upstream and
//! a fully-wired relay assembly over a temp directory.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use aegis_relay_core::application::cache::ResultCache;
use aegis_relay_core::application::facade::RelayFacade;
use aegis_relay_core::application::registry::RegistrySet;
use aegis_relay_core::infrastructure::client::ClientOptions;
use aegis_relay_core::infrastructure::event_bus::EventBus;
use aegis_relay_core::infrastructure::index::embed::HashEmbedder;
use aegis_relay_core::infrastructure::index::ToolIndex;
use aegis_relay_core::infrastructure::logs::LogSink;
use aegis_relay_core::infrastructure::manager::{ManagerOptions, UpstreamManager};
use aegis_relay_core::infrastructure::scheduler::SchedulerOptions;
use aegis_relay_core::infrastructure::storage::Storage;

/// A POSIX-sh MCP upstream: answers `initialize`, `tools/list` and
/// `tools/call` positionally (request ids are deterministic), exposing one
/// `echo_text` tool.
pub fn mock_upstream_script(dir: &Path) -> String {
    let script = r#"read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-03-26","capabilities":{"tools":{}},"serverInfo":{"name":"mock-upstream","version":"0.1.0"}}}'
read -r line
i=2
while read -r line; do
  case "$line" in
    *tools/list*)
      printf '{"jsonrpc":"2.0","id":%d,"result":{"tools":[{"name":"echo_text","description":"Echo text back to the caller","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}}]}}\n' "$i"
      ;;
    *tools/call*)
      printf '{"jsonrpc":"2.0","id":%d,"result":{"content":[{"type":"text","text":"echoed"}]}}\n' "$i"
      ;;
    *)
      printf '{"jsonrpc":"2.0","id":%d,"result":{}}\n' "$i"
      ;;
  esac
  i=$((i+1))
done
"#;
    let path = dir.join("mock_upstream.sh");
    std::fs::write(&path, script).unwrap();
    path.display().to_string()
}

pub struct Relay {
    pub bus: EventBus,
    pub storage: Arc<Storage>,
    pub manager: Arc<UpstreamManager>,
    pub facade: RelayFacade,
}

/// Options tuned so lifecycle tests run in milliseconds, not minutes.
pub fn fast_options() -> ManagerOptions {
    ManagerOptions {
        scheduler: SchedulerOptions {
            max_waves: 2,
            base_timeout: Duration::from_secs(5),
            max_workers: 4,
        },
        client: ClientOptions {
            startup_grace: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
        },
        health_interval: Duration::from_millis(100),
        probe_interval: Duration::from_secs(60),
        recovery_window: Duration::from_millis(10),
    }
}

pub fn build_relay(dir: &Path, options: ManagerOptions, semantic: bool) -> Relay {
    let bus = EventBus::new();
    let storage = Arc::new(
        Storage::open(dir, &dir.join("config.json"), bus.clone()).unwrap(),
    );
    let index = if semantic {
        Arc::new(ToolIndex::new(Some(Arc::new(HashEmbedder::new())), None, 0.5, 0.0))
    } else {
        Arc::new(ToolIndex::keyword_only())
    };
    let log = Arc::new(LogSink::open(&dir.join("logs")).unwrap());
    let manager = UpstreamManager::new(
        bus.clone(),
        Arc::clone(&storage),
        index,
        log,
        options,
    )
    .unwrap();
    let facade = RelayFacade::new(
        Arc::clone(&manager),
        ResultCache::default(),
        RegistrySet::new(),
        15,
    );
    Relay { bus, storage, manager, facade }
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_for<F>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
