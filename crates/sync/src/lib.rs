// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Arena sync: real-time session layer for coding battle rooms.

pub mod bus;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod latency;
pub mod metadata;
pub mod notice;
pub mod overlay;
pub mod protocol;
pub mod session;
pub mod snapshot;
pub mod token;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;

use crate::config::SyncConfig;
use crate::connection::TungsteniteConnector;
use crate::latency::LatencyGrade;
use crate::notice::{SessionNotice, Severity};
use crate::session::ChallengeSession;

/// Join the configured room and log its live state until Ctrl-C, a
/// navigate-away countdown, or reconnect exhaustion.
pub async fn run(config: SyncConfig) -> anyhow::Result<()> {
    let session = ChallengeSession::start(config, Arc::new(TungsteniteConnector));
    let mut status_rx = session.watch_status();
    let mut snapshot_rx = session.watch_snapshot();
    let mut latency_rx = session.watch_latency();
    let mut notices = session.notices();

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break Ok(());
            }
            Ok(()) = status_rx.changed() => {
                let status = *status_rx.borrow_and_update();
                tracing::info!(
                    state = %status.state,
                    generation = status.generation,
                    attempt = status.attempt,
                    "connection status"
                );
                if status.exhausted {
                    break Err(anyhow::anyhow!(
                        "connection lost after {} reconnect attempts",
                        status.attempt
                    ));
                }
            }
            Ok(()) = snapshot_rx.changed() => {
                let snapshot = snapshot_rx.borrow_and_update().clone();
                tracing::info!(
                    title = snapshot.title.as_deref().unwrap_or(""),
                    status = snapshot.status.as_deref().unwrap_or(""),
                    participants = snapshot.participants.len(),
                    chat = snapshot.chat.len(),
                    leaderboard = snapshot.leaderboard.len(),
                    "snapshot updated"
                );
                tracing::debug!(snapshot = %serde_json::to_string(&snapshot)?, "snapshot");
            }
            Ok(()) = latency_rx.changed() => {
                if let Some(rtt) = *latency_rx.borrow_and_update() {
                    let grade = LatencyGrade::from_rtt(rtt);
                    tracing::debug!(
                        rtt_ms = rtt.as_millis() as u64,
                        grade = grade.as_str(),
                        "latency"
                    );
                }
            }
            notice = notices.recv() => match notice {
                Ok(notice) => {
                    log_notice(&notice);
                    if matches!(notice, SessionNotice::NavigateAway { .. }) {
                        break Ok(());
                    }
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "notices lagged"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    session.shutdown();
    outcome
}

fn log_notice(notice: &SessionNotice) {
    let text = notice.toast_text();
    match notice.severity() {
        Severity::Info => tracing::info!(notice = %text, "notice"),
        Severity::Warning => tracing::warn!(notice = %text, "notice"),
        Severity::Error => tracing::error!(notice = %text, code = ?notice.code(), "notice"),
    }
}
