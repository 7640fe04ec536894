// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Domain layer: server records, state machines, events, tool metadata, and
//! the error taxonomy. No I/O lives here.

pub mod config;
pub mod error;
pub mod events;
pub mod server;
pub mod tool;

pub use config::{RelayConfig, SemanticSearchConfig};
pub use error::{ErrorKind, RelayError, Result};
pub use events::{ConfigAction, Event, EventKind, EventPayload};
pub use server::{
    AppState, ConnectionState, OAuthConfig, Protocol, ServerConfig, ServerRuntime, ServerStats,
    StartupMode, ToolDescriptor,
};
pub use tool::{fingerprint, parse_tool_ref, ToolEntry};
