// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Tool metadata and fingerprinting.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Deterministic digest of a tool's description and parameter schema.
///
/// Used to detect drift between discoveries and to key index invalidation.
pub fn fingerprint(description: &str, params_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(description.as_bytes());
    hasher.update(params_json.as_bytes());
    hex::encode(hasher.finalize())
}

/// One entry in the tool index, keyed by `(server_name, tool_name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolEntry {
    pub server_name: String,
    pub tool_name: String,
    pub description: String,
    pub params_json: String,
    pub hash: String,
    /// Cached connectivity flag; invalidated when the server disconnects.
    pub server_connected: bool,
}

impl ToolEntry {
    pub fn new(
        server_name: impl Into<String>,
        tool_name: impl Into<String>,
        description: impl Into<String>,
        params_json: impl Into<String>,
    ) -> Self {
        let description = description.into();
        let params_json = params_json.into();
        let hash = fingerprint(&description, &params_json);
        Self {
            server_name: server_name.into(),
            tool_name: tool_name.into(),
            description,
            params_json,
            hash,
            server_connected: true,
        }
    }

    /// Canonical `server:tool` key used by search results and the semantic
    /// index sidecar.
    pub fn key(&self) -> String {
        format!("{}:{}", self.server_name, self.tool_name)
    }
}

/// Parse a `server:tool` reference. The server name must not be empty; the
/// tool name may itself contain colons (some upstreams namespace tools).
pub fn parse_tool_ref(s: &str) -> Option<(&str, &str)> {
    let (server, tool) = s.split_once(':')?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_input_sensitive() {
        let a = fingerprint("desc", "{}");
        let b = fingerprint("desc", "{}");
        let c = fingerprint("desc2", "{}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn entry_key_and_ref_round_trip() {
        let entry = ToolEntry::new("github", "create_issue", "Create an issue", "{}");
        assert_eq!(entry.key(), "github:create_issue");
        assert_eq!(parse_tool_ref(&entry.key()), Some(("github", "create_issue")));
        assert_eq!(parse_tool_ref("nocolon"), None);
        assert_eq!(parse_tool_ref(":tool"), None);
        assert_eq!(parse_tool_ref("srv:ns:tool"), Some(("srv", "ns:tool")));
    }
}
