// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `aegis-relay status` — query a running relay's `/healthz` and render a
//! per-server summary.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;

#[derive(Args)]
pub struct StatusArgs {
    /// Address of the running relay's HTTP surface
    #[arg(long, env = "AEGIS_RELAY_LISTEN", default_value = "127.0.0.1:8091")]
    listen: String,

    /// Print the raw JSON instead of the summary
    #[arg(long)]
    json: bool,
}

pub async fn run(args: StatusArgs) -> Result<()> {
    let url = format!("http://{}/healthz", args.listen);
    let body: Value = reqwest::get(&url)
        .await
        .with_context(|| format!("relay not reachable at {url}"))?
        .json()
        .await
        .context("invalid /healthz response")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let app_state = body["state"].as_str().unwrap_or("unknown");
    let state_colored = match app_state {
        "running" => app_state.green(),
        "degraded" => app_state.yellow(),
        other => other.red(),
    };
    println!("relay: {state_colored}");

    if let Some(servers) = body["servers"].as_object() {
        let mut names: Vec<&String> = servers.keys().collect();
        names.sort();
        for name in names {
            let server = &servers[name];
            let state = server["state"].as_str().unwrap_or("unknown");
            let tools = server["tool_count"].as_u64().unwrap_or(0);
            let marker = if state == "ready" { "●".green() } else { "●".red() };
            print!("  {marker} {name} [{state}] {tools} tools");
            if let Some(error) = server["last_error"].as_str() {
                print!(" — {}", error.dimmed());
            }
            println!();
        }
    }
    Ok(())
}
