// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The merged read model of one challenge room.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::metadata::ProblemMetadata;
use crate::protocol::{ChallengeMeta, ChatEntry, LeaderboardEntry, Notification, Participant};

/// Everything the UI shows about the room, built from independently arriving
/// partial payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeSnapshot {
    pub title: Option<String>,
    pub creator_id: Option<String>,
    pub start_time: Option<i64>,
    pub time_limit: Option<i64>,
    pub status: Option<String>,
    pub problem_ids: Vec<String>,
    pub problems: Vec<ProblemMetadata>,
    pub participants: BTreeMap<String, Participant>,
    pub chat: Vec<ChatEntry>,
    pub notifications: Vec<Notification>,
    pub leaderboard: Vec<LeaderboardEntry>,
    #[serde(skip_serializing)]
    pub challenge_token: Option<String>,
}

/// A shallow update: every `Some` field replaces the snapshot's field, every
/// `None` leaves it alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotPatch {
    pub title: Option<String>,
    pub creator_id: Option<String>,
    pub start_time: Option<i64>,
    pub time_limit: Option<i64>,
    pub status: Option<String>,
    pub problem_ids: Option<Vec<String>>,
    pub problems: Option<Vec<ProblemMetadata>>,
    pub participants: Option<BTreeMap<String, Participant>>,
    pub chat: Option<Vec<ChatEntry>>,
    pub notifications: Option<Vec<Notification>>,
    pub leaderboard: Option<Vec<LeaderboardEntry>>,
    /// `Some(None)` clears the token.
    pub challenge_token: Option<Option<String>>,
}

impl SnapshotPatch {
    /// Challenge metadata from the join reply or `GET_CHALLENGE_MIN`.
    pub fn from_meta(meta: ChallengeMeta) -> Self {
        Self {
            title: meta.title,
            creator_id: meta.creator_id,
            start_time: meta.start_time,
            time_limit: meta.time_limit,
            status: meta.status,
            problem_ids: meta.problem_ids,
            participants: meta.participants,
            ..Self::default()
        }
    }

    pub fn participants(participants: BTreeMap<String, Participant>) -> Self {
        Self { participants: Some(participants), ..Self::default() }
    }

    pub fn chat(chat: Vec<ChatEntry>) -> Self {
        Self { chat: Some(chat), ..Self::default() }
    }

    pub fn notifications(notifications: Vec<Notification>) -> Self {
        Self { notifications: Some(notifications), ..Self::default() }
    }

    pub fn leaderboard(leaderboard: Vec<LeaderboardEntry>) -> Self {
        Self { leaderboard: Some(leaderboard), ..Self::default() }
    }

    pub fn problems(problems: Vec<ProblemMetadata>) -> Self {
        Self { problems: Some(problems), ..Self::default() }
    }

    pub fn token(token: Option<String>) -> Self {
        Self { challenge_token: Some(token), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl ChallengeSnapshot {
    pub fn merge(&mut self, patch: SnapshotPatch) {
        fn put<T>(slot: &mut T, value: Option<T>) {
            if let Some(v) = value {
                *slot = v;
            }
        }

        if patch.title.is_some() {
            self.title = patch.title;
        }
        if patch.creator_id.is_some() {
            self.creator_id = patch.creator_id;
        }
        if patch.start_time.is_some() {
            self.start_time = patch.start_time;
        }
        if patch.time_limit.is_some() {
            self.time_limit = patch.time_limit;
        }
        if patch.status.is_some() {
            self.status = patch.status;
        }
        put(&mut self.problem_ids, patch.problem_ids);
        put(&mut self.problems, patch.problems);
        put(&mut self.participants, patch.participants);
        put(&mut self.chat, patch.chat);
        put(&mut self.notifications, patch.notifications);
        put(&mut self.leaderboard, patch.leaderboard);
        put(&mut self.challenge_token, patch.challenge_token);
    }

    /// Append one chat line. Repeats are real messages and are kept.
    pub fn push_chat(&mut self, entry: ChatEntry) {
        self.chat.push(entry);
    }
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
