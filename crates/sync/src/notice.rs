// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User-facing notices published by the session.
//!
//! Protocol handlers never talk to a toast surface directly. They publish a
//! [`SessionNotice`] and the presentation layer decides what to show.

use crate::error::ErrorCode;
use crate::overlay::OverlayKind;
use crate::protocol::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    Joined { title: Option<String> },
    JoinFailed { message: String },
    Presence { kind: EventKind, user_id: Option<String> },
    Abandoned,
    Finished,
    NavigateAway { overlay: OverlayKind },
    ProtocolError { detail: String },
    ApplicationError { kind: Option<EventKind>, message: String },
    ReconnectExhausted { attempts: u32 },
}

impl SessionNotice {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Joined { .. }
            | Self::Presence { .. }
            | Self::Finished
            | Self::NavigateAway { .. } => Severity::Info,
            Self::Abandoned => Severity::Warning,
            Self::JoinFailed { .. }
            | Self::ProtocolError { .. }
            | Self::ApplicationError { .. }
            | Self::ReconnectExhausted { .. } => Severity::Error,
        }
    }

    /// Error code for notices that report a failure.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::JoinFailed { .. } | Self::ApplicationError { .. } => Some(ErrorCode::Application),
            Self::ProtocolError { .. } => Some(ErrorCode::Protocol),
            Self::ReconnectExhausted { .. } => Some(ErrorCode::Transport),
            _ => None,
        }
    }

    pub fn toast_text(&self) -> String {
        match self {
            Self::Joined { title: Some(title) } => format!("Joined {title}"),
            Self::Joined { title: None } => "Joined challenge".to_owned(),
            Self::JoinFailed { message } => format!("Could not join: {message}"),
            Self::Presence { kind, user_id } => {
                let who = user_id.as_deref().unwrap_or("Someone");
                match kind {
                    EventKind::UserJoined => format!("{who} joined the challenge"),
                    EventKind::UserLeft => format!("{who} left the challenge"),
                    EventKind::OwnerJoined => "The owner joined the challenge".to_owned(),
                    EventKind::OwnerLeft => "The owner left the challenge".to_owned(),
                    _ => format!("{who}: {kind}"),
                }
            }
            Self::Abandoned => "The creator abandoned this challenge".to_owned(),
            Self::Finished => "Challenge finished".to_owned(),
            Self::NavigateAway { .. } => "Leaving the challenge".to_owned(),
            Self::ProtocolError { .. } => {
                "Received a malformed message from the server".to_owned()
            }
            Self::ApplicationError { message, .. } => message.clone(),
            Self::ReconnectExhausted { attempts } => {
                format!("Could not reconnect after {attempts} attempts")
            }
        }
    }
}

#[cfg(test)]
#[path = "notice_tests.rs"]
mod tests;
