// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `aegis-relay config` — show and validate the config file without
//! starting the daemon.

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use aegis_relay_core::domain::config::RelayConfig;
use aegis_relay_core::runtime::RuntimeOptions;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration as JSON
    Show,
    /// Parse and validate the configuration file
    Validate,
}

fn config_path(config: Option<PathBuf>) -> Result<PathBuf> {
    match config {
        Some(path) => Ok(path),
        None => Ok(RuntimeOptions::discover()
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .config_path),
    }
}

fn load(path: &PathBuf) -> Result<RelayConfig> {
    if !path.exists() {
        bail!("config file not found: {}", path.display());
    }
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse {}", path.display()))
}

pub fn run(config: Option<PathBuf>, command: ConfigCommand) -> Result<()> {
    let path = config_path(config)?;
    match command {
        ConfigCommand::Show => {
            let config = load(&path)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigCommand::Validate => {
            let config = load(&path)?;
            match config.validate() {
                Ok(()) => {
                    println!(
                        "{} {} ({} servers, {} groups)",
                        "valid:".green().bold(),
                        path.display(),
                        config.mcp_servers.len(),
                        config.groups.len(),
                    );
                    Ok(())
                }
                Err(message) => bail!("invalid config: {message}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "mcpServers": [] }"#).unwrap();
        run(Some(path), ConfigCommand::Validate).unwrap();
    }

    #[test]
    fn validate_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "mcpServers": [
                { "name": "a", "protocol": "stdio", "command": "x" },
                { "name": "a", "protocol": "stdio", "command": "y" }
            ] }"#,
        )
        .unwrap();
        assert!(run(Some(path), ConfigCommand::Validate).is_err());
    }

    #[test]
    fn missing_file_errors() {
        assert!(run(Some(PathBuf::from("/nonexistent/config.json")), ConfigCommand::Show).is_err());
    }
}
