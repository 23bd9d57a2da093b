// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::EventKind;

/// Machine-readable error codes for challenge session failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Transport,
    Protocol,
    Application,
    AuthExpired,
    Timeout,
    Superseded,
    Closed,
    Rejected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "TRANSPORT_ERROR",
            Self::Protocol => "PROTOCOL_ERROR",
            Self::Application => "APPLICATION_ERROR",
            Self::AuthExpired => "AUTH_EXPIRED",
            Self::Timeout => "TIMEOUT",
            Self::Superseded => "SUPERSEDED",
            Self::Closed => "CLOSED",
            Self::Rejected => "REJECTED",
        }
    }

    /// Whether the session recovers from this failure without user involvement.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport | Self::Timeout | Self::Closed)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The socket is not open, failed to open, or broke mid-write.
    Transport(String),
    /// An inbound frame was not valid JSON or did not match its declared type.
    Protocol(String),
    /// The server answered with `status: "error"`.
    Application(String),
    /// An authenticated request was attempted without a live session token.
    AuthExpired,
    /// No reply arrived within the request timeout.
    Timeout { kind: EventKind, after: Duration },
    /// A newer request of the same type took over the reply slot.
    Superseded(EventKind),
    /// The connection closed while the request was outstanding.
    Closed,
    /// The request was refused locally before reaching the wire.
    Rejected(String),
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Transport(_) => ErrorCode::Transport,
            Self::Protocol(_) => ErrorCode::Protocol,
            Self::Application(_) => ErrorCode::Application,
            Self::AuthExpired => ErrorCode::AuthExpired,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Superseded(_) => ErrorCode::Superseded,
            Self::Closed => ErrorCode::Closed,
            Self::Rejected(_) => ErrorCode::Rejected,
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Application(msg) => write!(f, "{msg}"),
            Self::AuthExpired => f.write_str("no session token for the current connection"),
            Self::Timeout { kind, after } => {
                write!(f, "{kind} timed out after {}ms", after.as_millis())
            }
            Self::Superseded(kind) => write!(f, "{kind} superseded by a newer request"),
            Self::Closed => f.write_str("connection closed"),
            Self::Rejected(msg) => write!(f, "rejected: {msg}"),
        }
    }
}

impl std::error::Error for SyncError {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
