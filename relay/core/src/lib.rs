// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # aegis-relay-core
//!
//! The runtime heart of the AEGIS MCP relay — a local proxy and supervisor
//! that aggregates many Model Context Protocol upstream servers behind a
//! single MCP endpoint. Downstream clients connect once; the relay discovers
//! the union of all upstream tools, exposes a compact meta-tool surface
//! (`retrieve_tools`, `call_tool`, administration), and routes invocations to
//! the right upstream while owning that upstream's entire lifecycle: spawn,
//! initialize, health-check, reconnect, auto-disable, quarantine.
//!
//! ## Layer Structure
//!
//! ```text
//! presentation/   ← downstream MCP endpoint (stdio JSON-RPC), WebSocket/HTTP API (axum)
//!     ↓
//! application/    ← facade use-cases, result cache, registry adapters, group control
//!     ↓
//! domain/         ← server records, state machines, events, tool metadata, error kinds
//!     ↓
//! infrastructure/ ← event bus, sled + config-file storage, transports, managed client,
//!                   connection scheduler, upstream manager, tool index, log sinks
//! ```
//!
//! ## Integration Tests
//!
//! See `relay/core/tests/` for cross-component scenario tests covering
//! auto-disable and recovery, two-phase storage rollback, hybrid search
//! ranking, quarantine enforcement, and wave scheduling.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;
pub mod runtime;

pub use domain::*;
