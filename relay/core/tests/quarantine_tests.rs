// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Quarantine enforcement: hidden from search, refused at dispatch, and no
//! transport I/O whatsoever.

mod support;

use serde_json::json;

use aegis_relay_core::domain::server::{ConnectionState, ServerConfig};
use aegis_relay_core::domain::tool::ToolEntry;

#[tokio::test]
async fn quarantined_server_is_hidden_refused_and_never_spawned() {
    let dir = tempfile::tempdir().unwrap();
    let relay = support::build_relay(dir.path(), support::fast_options(), false);

    // If the relay ever spawned this upstream, the marker file would exist.
    let marker = dir.path().join("spawned.marker");
    let mut config = ServerConfig::stdio(
        "dangerous",
        "touch",
        &[marker.to_str().unwrap()],
    );
    config.startup_mode = aegis_relay_core::domain::server::StartupMode::Quarantined;
    relay.manager.add_or_update_server(config).await.unwrap();

    // Another server's tools keep search results non-trivial.
    relay
        .manager
        .index()
        .batch_index(vec![
            ToolEntry::new("safe", "list_files", "List files in a directory", "{}"),
        ])
        .await
        .unwrap();
    // Tools that slipped into the index for the quarantined server are
    // filtered at query time regardless.
    relay
        .manager
        .index()
        .batch_index(vec![
            ToolEntry::new("dangerous", "run_anything", "Run an arbitrary command", "{}"),
        ])
        .await
        .unwrap();

    relay.manager.start().await;

    // Scheduler skipped it entirely.
    let client = relay.manager.client("dangerous").await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // retrieve_tools returns nothing from the quarantined server.
    let found = relay
        .facade
        .retrieve_tools(json!({ "query": "run an arbitrary command" }))
        .await
        .unwrap();
    for tool in found["tools"].as_array().unwrap() {
        assert_ne!(tool["server"], "dangerous");
    }

    // call_tool refuses with the quarantined kind.
    let err = relay
        .facade
        .call_tool(json!({ "server": "dangerous", "tool": "run_anything", "arguments": {} }))
        .await
        .unwrap_err();
    assert_eq!(err.kind().as_str(), "quarantined");

    // And no transport I/O ever happened.
    assert!(!marker.exists(), "quarantined upstream was spawned");

    relay.manager.shutdown().await;
}

#[tokio::test]
async fn unquarantine_restores_search_visibility() {
    let dir = tempfile::tempdir().unwrap();
    let relay = support::build_relay(dir.path(), support::fast_options(), false);

    relay
        .manager
        .add_or_update_server(ServerConfig::stdio("s", "cat", &[]))
        .await
        .unwrap();
    relay
        .facade
        .quarantine_security(json!({ "operation": "quarantine", "name": "s" }))
        .await
        .unwrap();

    // While quarantined, even freshly-injected entries stay invisible.
    relay
        .manager
        .index()
        .batch_index(vec![ToolEntry::new("s", "tool_a", "Do the thing", "{}")])
        .await
        .unwrap();
    let found = relay
        .facade
        .retrieve_tools(json!({ "query": "do the thing" }))
        .await
        .unwrap();
    assert_eq!(found["total"], 0);

    relay
        .facade
        .quarantine_security(json!({ "operation": "unquarantine", "name": "s" }))
        .await
        .unwrap();
    let found = relay
        .facade
        .retrieve_tools(json!({ "query": "do the thing" }))
        .await
        .unwrap();
    assert_eq!(found["total"], 1);

    relay.manager.shutdown().await;
}
