// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end over a real stdio upstream: connection waves, handshake,
//! discovery, indexing, routed calls and log tailing.

mod support;

use std::time::Duration;

use serde_json::json;

use aegis_relay_core::domain::server::{ConnectionState, ServerConfig};

#[tokio::test]
async fn connects_discovers_and_routes() {
    let dir = tempfile::tempdir().unwrap();
    let script = support::mock_upstream_script(dir.path());
    let relay = support::build_relay(dir.path(), support::fast_options(), false);

    let config = ServerConfig::stdio("mock", "sh", &[script.as_str()]);
    relay.manager.add_or_update_server(config).await.unwrap();

    let report = relay.manager.start().await;
    assert_eq!(report.total, 1);
    assert_eq!(report.successful, 1);
    assert_eq!(report.failed, 0);

    let client = relay.manager.client("mock").await.unwrap();
    assert_eq!(client.state(), ConnectionState::Ready);

    // Indexing is event-driven; give the bus listener a beat.
    let index = relay.manager.index();
    assert!(
        support::wait_for(Duration::from_secs(5), || index.len() == 1).await,
        "tools were not indexed"
    );

    // The discovered tool is searchable with its server prefix.
    let found = relay
        .facade
        .retrieve_tools(json!({ "query": "echo text back" }))
        .await
        .unwrap();
    assert_eq!(found["tools"][0]["name"], "mock:echo_text");

    // Routed invocation round-trips through the subprocess.
    let result = relay
        .facade
        .call_tool(json!({
            "server": "mock",
            "tool": "echo_text",
            "arguments": { "text": "hi" }
        }))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "echoed");

    // Cached tool list and stats agree.
    let tools = relay.manager.list_tools("mock").await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo_text");
    let stats = relay.manager.get_stats().await;
    assert!(stats["mock"].connected);
    assert_eq!(stats["mock"].tool_count, 1);

    relay.manager.shutdown().await;
}

#[tokio::test]
async fn removal_disconnects_and_scrubs_index() {
    let dir = tempfile::tempdir().unwrap();
    let script = support::mock_upstream_script(dir.path());
    let relay = support::build_relay(dir.path(), support::fast_options(), false);

    relay
        .manager
        .add_or_update_server(ServerConfig::stdio("mock", "sh", &[script.as_str()]))
        .await
        .unwrap();
    relay.manager.start().await;

    let index = relay.manager.index();
    assert!(support::wait_for(Duration::from_secs(5), || index.len() == 1).await);

    relay.manager.remove_server("mock").await.unwrap();
    assert_eq!(index.len(), 0);
    assert!(relay.manager.client("mock").await.is_none());
    assert!(relay.storage.get_server("mock").unwrap().is_none());

    relay.manager.shutdown().await;
}

#[tokio::test]
async fn lazy_loading_connects_on_first_call() {
    let dir = tempfile::tempdir().unwrap();
    let script = support::mock_upstream_script(dir.path());
    let relay = support::build_relay(dir.path(), support::fast_options(), false);

    let mut config = ServerConfig::stdio("lazy", "sh", &[script.as_str()]);
    config.startup_mode = aegis_relay_core::domain::server::StartupMode::LazyLoading;
    relay.manager.add_or_update_server(config).await.unwrap();

    // Lazy servers are not part of the startup waves.
    let report = relay.manager.start().await;
    assert_eq!(report.total, 0);
    let client = relay.manager.client("lazy").await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // First call triggers the on-demand connect, then routes.
    let result = relay
        .facade
        .call_tool(json!({ "tool": "lazy:echo_text", "arguments": { "text": "x" } }))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "echoed");
    assert_eq!(client.state(), ConnectionState::Ready);

    relay.manager.shutdown().await;
}
