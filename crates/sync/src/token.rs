// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session token issued by the join handshake.
//!
//! The token is bound to the connection generation it was issued on and is
//! never handed out for a different one. Optionally mirrored to a JSON file so
//! other local tools can pick up the live session.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    pub token: String,
    pub challenge_id: String,
    pub generation: u64,
    /// Epoch seconds.
    #[serde(default)]
    pub issued_at: i64,
}

pub struct SessionTokenStore {
    current: RwLock<Option<SessionToken>>,
    file: Option<PathBuf>,
}

impl SessionTokenStore {
    pub fn in_memory() -> Self {
        Self { current: RwLock::new(None), file: None }
    }

    pub fn with_file(path: PathBuf) -> Self {
        Self { current: RwLock::new(None), file: Some(path) }
    }

    pub fn set(&self, token: &str, challenge_id: &str, generation: u64) {
        let record = SessionToken {
            token: token.to_owned(),
            challenge_id: challenge_id.to_owned(),
            generation,
            issued_at: crate::protocol::epoch_secs(),
        };
        if let Some(ref path) = self.file {
            if let Err(e) = save(path, &record) {
                tracing::warn!(path = %path.display(), err = %e, "failed to persist session token");
            }
        }
        *self.current.write() = Some(record);
        tracing::debug!(challenge_id, generation, "session token stored");
    }

    pub fn get(&self) -> Option<SessionToken> {
        self.current.read().clone()
    }

    /// The token for `challenge_id` on connection `generation`.
    pub fn token_for(&self, challenge_id: &str, generation: u64) -> Result<String, SyncError> {
        match *self.current.read() {
            Some(ref t) if t.challenge_id == challenge_id && t.generation == generation => {
                Ok(t.token.clone())
            }
            _ => Err(SyncError::AuthExpired),
        }
    }

    /// Drop the token. Returns `true` if one was held.
    pub fn clear(&self) -> bool {
        let had = self.current.write().take().is_some();
        if let Some(ref path) = self.file {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    err = %e,
                    "failed to remove session token file"
                ),
            }
        }
        if had {
            tracing::debug!("session token cleared");
        }
        had
    }
}

/// Read a mirrored token file.
pub fn load(path: &Path) -> anyhow::Result<SessionToken> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Write the token file atomically (write tmp + rename), owner-only on Unix.
fn save(path: &Path, token: &SessionToken) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(token)?;
    let tmp_name = format!(
        "{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
    );
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, json)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;
