// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Error taxonomy for the relay core.
//!
//! Every public operation returns `Result<T, RelayError>`. The variant set is
//! the contract: callers (the MCP facade, the WebSocket layer, the CLI) match
//! on [`ErrorKind`] rather than on error strings. Low-level transport
//! failures are recovered locally (scheduler / health loop retries) until the
//! auto-disable threshold trips; policy refusals and `not_found` surface
//! immediately; a failed rollback is fatal and aborts the process.

use std::time::Duration;
use thiserror::Error;

/// Stable, serializable discriminant for [`RelayError`].
///
/// The snake_case names returned by [`ErrorKind::as_str`] are part of the
/// downstream MCP error contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Disabled,
    Quarantined,
    AutoDisabled,
    NotConnected,
    DeadlineExceeded,
    TransportFailure,
    OAuthRequired,
    OAuthBackoff,
    PersistenceFailure,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::Disabled => "disabled",
            Self::Quarantined => "quarantined",
            Self::AutoDisabled => "auto_disabled",
            Self::NotConnected => "not_connected",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::TransportFailure => "transport_failure",
            Self::OAuthRequired => "oauth_required",
            Self::OAuthBackoff => "oauth_backoff",
            Self::PersistenceFailure => "persistence_failure",
            Self::Fatal => "fatal",
        }
    }
}

/// Unified error type for all core operations.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("server not found: {0}")]
    NotFound(String),

    #[error("server '{0}' is disabled")]
    Disabled(String),

    #[error("server '{0}' is quarantined; unquarantine it before use")]
    Quarantined(String),

    #[error("server '{server}' is auto-disabled: {reason}")]
    AutoDisabled { server: String, reason: String },

    #[error("server '{0}' is not connected")]
    NotConnected(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("server '{0}' requires interactive OAuth login")]
    OAuthRequired(String),

    #[error("server '{server}' is in OAuth backoff; retry in {remaining:?}")]
    OAuthBackoff { server: String, remaining: Duration },

    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Invariant violation. Callers must treat this as unrecoverable.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Disabled(_) => ErrorKind::Disabled,
            Self::Quarantined(_) => ErrorKind::Quarantined,
            Self::AutoDisabled { .. } => ErrorKind::AutoDisabled,
            Self::NotConnected(_) => ErrorKind::NotConnected,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::Transport(_) => ErrorKind::TransportFailure,
            Self::OAuthRequired(_) => ErrorKind::OAuthRequired,
            Self::OAuthBackoff { .. } => ErrorKind::OAuthBackoff,
            Self::Persistence(_) => ErrorKind::PersistenceFailure,
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the scheduler / health loop may retry after this error.
    ///
    /// Policy refusals and caller mistakes are not retryable; transport and
    /// deadline failures are, until the client's own failure accounting trips
    /// auto-disable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::DeadlineExceeded
                | Self::NotConnected(_)
                | Self::Persistence(_)
        )
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Transport(format!("json: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(ErrorKind::DeadlineExceeded.as_str(), "deadline_exceeded");
        assert_eq!(ErrorKind::OAuthBackoff.as_str(), "oauth_backoff");
        assert_eq!(
            RelayError::Quarantined("x".into()).kind().as_str(),
            "quarantined"
        );
    }

    #[test]
    fn retryability_split() {
        assert!(RelayError::transport("boom").is_retryable());
        assert!(RelayError::DeadlineExceeded.is_retryable());
        assert!(!RelayError::Quarantined("x".into()).is_retryable());
        assert!(!RelayError::InvalidInput("x".into()).is_retryable());
    }
}
