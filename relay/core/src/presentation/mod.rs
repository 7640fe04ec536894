// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Presentation layer: the downstream MCP endpoint and the HTTP/WebSocket
//! surface.

pub mod http;
pub mod mcp;
pub mod ws;
