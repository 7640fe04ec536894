// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `aegis-relay serve` — run the relay in the foreground: initial connection
//! waves, health loops, the HTTP/WebSocket surface and (unless disabled) the
//! downstream MCP endpoint on stdio.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use aegis_relay_core::presentation::mcp;
use aegis_relay_core::runtime::{RelayRuntime, RuntimeOptions};

#[derive(Args)]
pub struct ServeArgs {
    /// Bind address for the HTTP/WebSocket surface (overrides config)
    #[arg(long, env = "AEGIS_RELAY_LISTEN")]
    listen: Option<String>,

    /// Do not serve MCP on stdio (HTTP/WS surface only)
    #[arg(long)]
    no_stdio: bool,
}

fn options(config: Option<PathBuf>, data_dir: Option<PathBuf>, listen: Option<String>) -> Result<RuntimeOptions> {
    let mut options = RuntimeOptions::discover()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("could not resolve data directory")?;
    if let Some(data_dir) = data_dir {
        options.config_path = data_dir.join("config.json");
        options.data_dir = data_dir;
    }
    if let Some(config) = config {
        options.config_path = config;
    }
    options.listen = listen;
    Ok(options)
}

pub async fn run(config: Option<PathBuf>, data_dir: Option<PathBuf>, args: ServeArgs) -> Result<()> {
    let options = options(config, data_dir, args.listen)?;
    info!(config = %options.config_path.display(), data = %options.data_dir.display(), "starting relay");

    let (runtime, report) = RelayRuntime::start(options)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    eprintln!(
        "{} {} of {} upstreams connected ({} retried, {} failed)",
        "ready:".green().bold(),
        report.successful,
        report.total,
        report.retried,
        report.failed,
    );

    let serve_stdio = runtime.config().serve_stdio && !args.no_stdio;
    let stdio_cancel = CancellationToken::new();
    let stdio_task = if serve_stdio {
        let facade = runtime.facade();
        let cancel = stdio_cancel.clone();
        // The token doubles as the hangup signal: serve_stdio returning on
        // EOF cancels it, which the select below observes.
        let done = stdio_cancel.clone();
        Some(tokio::spawn(async move {
            let result = mcp::serve_stdio(facade, cancel).await;
            done.cancel();
            result
        }))
    } else {
        None
    };

    // Run until SIGINT/SIGTERM, or until the downstream client hangs up.
    let shutdown_reason = tokio::select! {
        _ = shutdown_signal() => "signal",
        _ = async {
            match &stdio_task {
                // Pending forever when stdio serving is off.
                None => std::future::pending::<()>().await,
                Some(_) => stdio_cancel.cancelled().await,
            }
        } => "stdio closed",
    };
    eprintln!("{} shutting down ({shutdown_reason})", "stopping:".yellow().bold());

    stdio_cancel.cancel();
    if let Some(task) = stdio_task {
        let _ = task.await;
    }
    runtime.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
