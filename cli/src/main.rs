// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # AEGIS Relay CLI
//!
//! The `aegis-relay` binary runs the MCP aggregation relay.
//!
//! ## Commands
//!
//! - `aegis-relay serve` - Run the relay daemon (MCP on stdio, HTTP/WS surface)
//! - `aegis-relay status` - Query a running relay's `/healthz`
//! - `aegis-relay config show|validate` - Configuration management

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::{ConfigCommand, ServeArgs, StatusArgs};

/// AEGIS Relay - aggregate MCP servers behind a single endpoint
#[derive(Parser)]
#[command(name = "aegis-relay")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "AEGIS_RELAY_CONFIG",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Data directory (record store, logs, semantic sidecar)
    #[arg(long, global = true, env = "AEGIS_RELAY_DATA_DIR", value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay in the foreground
    Serve(ServeArgs),
    /// Show the state of a running relay
    Status(StatusArgs),
    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("AEGIS_RELAY_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => commands::serve::run(cli.config, cli.data_dir, args).await,
        Command::Status(args) => commands::status::run(args).await,
        Command::Config { command } => commands::config::run(cli.config, command),
    }
}
