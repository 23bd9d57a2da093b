// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use crate::connection::ReconnectPolicy;
use crate::dispatch::CorrelationMode;

pub const DEFAULT_PING_INTERVAL_MS: u64 = 3000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_RECONNECTS: u32 = 5;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Configuration for one challenge room session.
#[derive(Debug, Clone, clap::Parser)]
#[command(
    name = "arena-sync",
    version,
    about = "Join a coding battle room and follow its live state"
)]
pub struct SyncConfig {
    /// Room WebSocket endpoint.
    #[arg(long, default_value = "ws://127.0.0.1:7777/ws", env = "ARENA_WS_URL")]
    pub url: String,

    /// REST base URL for problem metadata. Lookups are skipped when unset.
    #[arg(long, env = "ARENA_API_URL")]
    pub api_url: Option<String>,

    /// Bearer token of the signed-in user.
    #[arg(long, env = "ARENA_AUTH_TOKEN")]
    pub auth_token: String,

    #[arg(long, env = "ARENA_USER_ID")]
    pub user_id: String,

    #[arg(long, env = "ARENA_CHALLENGE_ID")]
    pub challenge_id: String,

    /// Avatar URL attached to outgoing chat lines.
    #[arg(long, default_value = "", env = "ARENA_PROFILE_PIC")]
    pub profile_pic: String,

    /// Room password, empty for public rooms.
    #[arg(long, default_value = "", env = "ARENA_CHALLENGE_PASSWORD")]
    pub password: String,

    /// Latency probe interval in milliseconds.
    #[arg(long, default_value_t = DEFAULT_PING_INTERVAL_MS, env = "ARENA_PING_INTERVAL_MS")]
    pub ping_interval_ms: u64,

    /// Time to wait for a reply before failing a request, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_MS, env = "ARENA_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,

    /// Reconnect attempts before giving up.
    #[arg(long, default_value_t = DEFAULT_MAX_RECONNECTS, env = "ARENA_MAX_RECONNECTS")]
    pub max_reconnects: u32,

    /// Backoff base in milliseconds; attempt n waits base * 2^n.
    #[arg(long, default_value_t = DEFAULT_BACKOFF_BASE_MS, env = "ARENA_BACKOFF_BASE_MS")]
    pub backoff_base_ms: u64,

    /// Mirror the session token to this JSON file.
    #[arg(long, env = "ARENA_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,

    /// How replies are matched to requests.
    #[arg(
        long,
        value_enum,
        default_value_t = CorrelationMode::RequestId,
        env = "ARENA_CORRELATION"
    )]
    pub correlation: CorrelationMode,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "ARENA_LOG_FORMAT")]
    pub log_format: LogFormat,
}

impl SyncConfig {
    /// Config with defaults for everything but the identity fields.
    pub fn new(
        url: impl Into<String>,
        auth_token: impl Into<String>,
        user_id: impl Into<String>,
        challenge_id: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            api_url: None,
            auth_token: auth_token.into(),
            user_id: user_id.into(),
            challenge_id: challenge_id.into(),
            profile_pic: String::new(),
            password: String::new(),
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            token_file: None,
            correlation: CorrelationMode::RequestId,
            log_format: LogFormat::Text,
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnects,
            base: Duration::from_millis(self.backoff_base_ms),
        }
    }

    /// The bearer token as sent in the join payload.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.auth_token)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
