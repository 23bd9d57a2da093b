// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire envelope, event catalog, and typed payloads for the challenge room protocol.
//!
//! Every frame in both directions is a JSON envelope `{"type": ..., "payload": {...}}`.
//! Inbound envelopes are decoded into [`ServerEvent`] at the parse boundary so
//! unknown types and malformed payloads fail closed instead of leaking raw JSON
//! into the session.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Payload key carrying the per-request correlation id.
pub const REQUEST_ID_KEY: &str = "requestId";

// -- Event catalog -------------------------------------------------------------

/// Every event type the room protocol knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    JoinChallenge,
    RefetchChallenge,
    GetChallengeMin,
    GetParticipantsData,
    GetChat,
    GetNotifications,
    GetLeaderboard,
    PushNewChat,
    ChallengeStarted,
    UserJoined,
    UserLeft,
    OwnerJoined,
    OwnerLeft,
    CreatorAbandon,
    GameFinished,
    PingServer,
    NewOwnerAssigned,
    LeaderboardUpdate,
    ChatMessage,
}

impl EventKind {
    pub const ALL: [EventKind; 19] = [
        Self::JoinChallenge,
        Self::RefetchChallenge,
        Self::GetChallengeMin,
        Self::GetParticipantsData,
        Self::GetChat,
        Self::GetNotifications,
        Self::GetLeaderboard,
        Self::PushNewChat,
        Self::ChallengeStarted,
        Self::UserJoined,
        Self::UserLeft,
        Self::OwnerJoined,
        Self::OwnerLeft,
        Self::CreatorAbandon,
        Self::GameFinished,
        Self::PingServer,
        Self::NewOwnerAssigned,
        Self::LeaderboardUpdate,
        Self::ChatMessage,
    ];

    /// The five granular fetches issued once a session is authenticated.
    pub const HYDRATION: [EventKind; 5] = [
        Self::GetChallengeMin,
        Self::GetParticipantsData,
        Self::GetChat,
        Self::GetNotifications,
        Self::GetLeaderboard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JoinChallenge => "JOIN_CHALLENGE",
            Self::RefetchChallenge => "REFETCH_CHALLENGE",
            Self::GetChallengeMin => "GET_CHALLENGE_MIN",
            Self::GetParticipantsData => "GET_PARTICIPANTS_DATA",
            Self::GetChat => "GET_CHAT",
            Self::GetNotifications => "GET_NOTIFICATIONS",
            Self::GetLeaderboard => "GET_LEADERBOARD",
            Self::PushNewChat => "PUSH_NEW_CHAT",
            Self::ChallengeStarted => "CHALLENGE_STARTED",
            Self::UserJoined => "USER_JOINED",
            Self::UserLeft => "USER_LEFT",
            Self::OwnerJoined => "OWNER_JOINED",
            Self::OwnerLeft => "OWNER_LEFT",
            Self::CreatorAbandon => "CREATOR_ABANDON",
            Self::GameFinished => "GAME_FINISHED",
            Self::PingServer => "PING_SERVER",
            Self::NewOwnerAssigned => "NEW_OWNER_ASSIGNED",
            Self::LeaderboardUpdate => "LEADERBOARD_UPDATE",
            Self::ChatMessage => "CHAT_MESSAGE",
        }
    }

    /// Requests that may only be sent while a session token is held.
    pub fn requires_session_token(&self) -> bool {
        matches!(
            self,
            Self::GetChallengeMin
                | Self::GetParticipantsData
                | Self::GetChat
                | Self::GetNotifications
                | Self::GetLeaderboard
                | Self::PushNewChat
                | Self::ChallengeStarted
        )
    }

    /// Participant or owner joined/left broadcasts.
    pub fn is_presence(&self) -> bool {
        matches!(self, Self::UserJoined | Self::UserLeft | Self::OwnerJoined | Self::OwnerLeft)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| SyncError::Protocol(format!("unknown event type: {s}")))
    }
}

// -- Envelope ------------------------------------------------------------------

/// The `{type, payload}` frame shape shared by both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind: kind.as_str().to_owned(),
            payload,
            status: None,
            success: None,
            error: None,
            request_id: None,
        }
    }

    /// Parse one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text).map_err(|e| SyncError::Protocol(format!("invalid frame: {e}")))
    }

    pub fn to_text(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::Protocol(e.to_string()))
    }

    pub fn event_kind(&self) -> Result<EventKind, SyncError> {
        self.kind.parse()
    }

    /// Whether the server flagged this envelope as a failed request.
    pub fn is_error(&self) -> bool {
        self.status.as_deref() == Some("error") || self.success == Some(false)
    }

    /// Best-effort human message for an error envelope.
    pub fn error_message(&self) -> String {
        if let Some(ref err) = self.error {
            return err.clone();
        }
        ["message", "error"]
            .iter()
            .find_map(|key| self.payload.get(*key).and_then(|v| v.as_str()))
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{} failed", self.kind))
    }

    /// Request id echoed by the server, at envelope level or inside the payload.
    pub fn correlation_id(&self) -> Option<&str> {
        self.request_id
            .as_deref()
            .or_else(|| self.payload.get(REQUEST_ID_KEY).and_then(|v| v.as_str()))
    }
}

/// Insert (or replace) the request id in an outbound payload.
///
/// A null payload becomes an object. Non-object payloads are left untouched
/// and `false` is returned.
pub fn stamp_request_id(payload: &mut Value, request_id: &str) -> bool {
    if payload.is_null() {
        *payload = Value::Object(Map::new());
    }
    match payload.as_object_mut() {
        Some(obj) => {
            obj.insert(REQUEST_ID_KEY.to_owned(), Value::String(request_id.to_owned()));
            true
        }
        None => false,
    }
}

// -- Payload types -------------------------------------------------------------

/// Challenge metadata as sent in the join reply and `GET_CHALLENGE_MIN`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, alias = "processedProblemIds", skip_serializing_if = "Option::is_none")]
    pub problem_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<BTreeMap<String, Participant>>,
}

/// One participant record. Fields the client does not interpret are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub profile_pic: String,
    #[serde(default)]
    pub message: String,
    /// Epoch seconds.
    #[serde(default)]
    pub time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    #[serde(default)]
    pub user_id: String,
    #[serde(default, alias = "totalScore")]
    pub score: i64,
    #[serde(default)]
    pub problems_completed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinReply {
    #[serde(default)]
    pub challenge_token: String,
    #[serde(default)]
    pub challenge: ChallengeMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ParticipantsReply {
    #[serde(default)]
    pub participants: BTreeMap<String, Participant>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChatReply {
    #[serde(default)]
    pub chat: Vec<ChatEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NotificationsReply {
    #[serde(default)]
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LeaderboardReply {
    #[serde(default)]
    pub leaderboard: Vec<LeaderboardEntry>,
}

/// Payload of presence broadcasts and `CREATOR_ABANDON`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GameFinishedPayload {
    #[serde(default)]
    final_leaderboard: Vec<LeaderboardEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeStartedPayload {
    #[serde(default)]
    start_time: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnerPayload {
    #[serde(default)]
    user_id: String,
}

/// Decode a reply or broadcast payload into its typed shape.
///
/// A missing (null) payload decodes as an empty object so all-default shapes
/// still succeed.
pub fn decode_payload<T: DeserializeOwned>(
    kind: EventKind,
    payload: &Value,
) -> Result<T, SyncError> {
    let value = if payload.is_null() { Value::Object(Map::new()) } else { payload.clone() };
    serde_json::from_value(value).map_err(|e| SyncError::Protocol(format!("{kind} payload: {e}")))
}

// -- Server events -------------------------------------------------------------

/// An inbound envelope validated against its declared type.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    UserJoined(Presence),
    UserLeft(Presence),
    OwnerJoined(Presence),
    OwnerLeft(Presence),
    CreatorAbandon(Presence),
    GameFinished { final_leaderboard: Vec<LeaderboardEntry> },
    ChallengeStarted { start_time: Option<i64> },
    NewOwnerAssigned { user_id: String },
    LeaderboardUpdate { leaderboard: Vec<LeaderboardEntry> },
    ChatMessage(ChatEntry),
    RefetchChallenge,
    /// Reply to a client request; the waiting caller decodes the payload.
    Reply { kind: EventKind, payload: Value },
}

impl ServerEvent {
    pub fn decode(envelope: &Envelope) -> Result<Self, SyncError> {
        let kind = envelope.event_kind()?;
        let payload = &envelope.payload;
        let event = match kind {
            EventKind::UserJoined => Self::UserJoined(decode_payload(kind, payload)?),
            EventKind::UserLeft => Self::UserLeft(decode_payload(kind, payload)?),
            EventKind::OwnerJoined => Self::OwnerJoined(decode_payload(kind, payload)?),
            EventKind::OwnerLeft => Self::OwnerLeft(decode_payload(kind, payload)?),
            EventKind::CreatorAbandon => Self::CreatorAbandon(decode_payload(kind, payload)?),
            EventKind::GameFinished => {
                let p: GameFinishedPayload = decode_payload(kind, payload)?;
                Self::GameFinished { final_leaderboard: p.final_leaderboard }
            }
            EventKind::ChallengeStarted => {
                let p: ChallengeStartedPayload = decode_payload(kind, payload)?;
                Self::ChallengeStarted { start_time: p.start_time }
            }
            EventKind::NewOwnerAssigned => {
                let p: OwnerPayload = decode_payload(kind, payload)?;
                if p.user_id.is_empty() {
                    return Err(SyncError::Protocol(format!("{kind} payload: missing userId")));
                }
                Self::NewOwnerAssigned { user_id: p.user_id }
            }
            EventKind::LeaderboardUpdate => {
                let p: LeaderboardReply = decode_payload(kind, payload)?;
                Self::LeaderboardUpdate { leaderboard: p.leaderboard }
            }
            EventKind::ChatMessage => Self::ChatMessage(decode_payload(kind, payload)?),
            EventKind::RefetchChallenge => Self::RefetchChallenge,
            EventKind::JoinChallenge
            | EventKind::GetChallengeMin
            | EventKind::GetParticipantsData
            | EventKind::GetChat
            | EventKind::GetNotifications
            | EventKind::GetLeaderboard
            | EventKind::PushNewChat
            | EventKind::PingServer => Self::Reply { kind, payload: payload.clone() },
        };
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::UserJoined(_) => EventKind::UserJoined,
            Self::UserLeft(_) => EventKind::UserLeft,
            Self::OwnerJoined(_) => EventKind::OwnerJoined,
            Self::OwnerLeft(_) => EventKind::OwnerLeft,
            Self::CreatorAbandon(_) => EventKind::CreatorAbandon,
            Self::GameFinished { .. } => EventKind::GameFinished,
            Self::ChallengeStarted { .. } => EventKind::ChallengeStarted,
            Self::NewOwnerAssigned { .. } => EventKind::NewOwnerAssigned,
            Self::LeaderboardUpdate { .. } => EventKind::LeaderboardUpdate,
            Self::ChatMessage(_) => EventKind::ChatMessage,
            Self::RefetchChallenge => EventKind::RefetchChallenge,
            Self::Reply { kind, .. } => *kind,
        }
    }
}

// -- Utility -------------------------------------------------------------------

/// Append the bearer token as a percent-encoded `token` query parameter to the
/// room WebSocket URL, keeping any query the base already carries.
pub fn build_ws_url(base_url: &str, auth_token: &str) -> Result<String, SyncError> {
    let mut url = reqwest::Url::parse(base_url)
        .map_err(|e| SyncError::Transport(format!("invalid room url {base_url:?}: {e}")))?;
    url.query_pairs_mut().append_pair("token", auth_token);
    Ok(url.into())
}

/// Current epoch seconds.
pub fn epoch_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
