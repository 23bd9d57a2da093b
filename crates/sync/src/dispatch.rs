// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound envelopes and reply correlation.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::connection::ConnectionManager;
use crate::error::SyncError;
use crate::protocol::{stamp_request_id, Envelope, EventKind};

/// How inbound replies are matched to pending requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum CorrelationMode {
    /// Each request carries a fresh `requestId`; replies are matched on it.
    #[default]
    RequestId,
    /// One slot per event type. A second request of the same type evicts the
    /// first, whose waiter fails with [`SyncError::Superseded`].
    EventType,
}

struct Pending {
    id: String,
    kind: EventKind,
    tx: oneshot::Sender<Result<Envelope, SyncError>>,
}

/// Serializes envelopes onto the connection and tracks reply waiters.
pub struct OutboundDispatcher {
    connection: Arc<ConnectionManager>,
    mode: CorrelationMode,
    timeout: Duration,
    /// Oldest first.
    pending: Mutex<Vec<Pending>>,
}

impl OutboundDispatcher {
    pub fn new(
        connection: Arc<ConnectionManager>,
        mode: CorrelationMode,
        timeout: Duration,
    ) -> Self {
        Self { connection, mode, timeout, pending: Mutex::new(Vec::new()) }
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    /// Fire-and-forget write of `{type, payload}`.
    pub fn send(&self, kind: EventKind, payload: Value) -> Result<(), SyncError> {
        let text = Envelope::new(kind, payload).to_text()?;
        self.connection.send_text(text)?;
        tracing::debug!(event = %kind, "sent");
        Ok(())
    }

    /// Write a request and wait for its reply.
    ///
    /// Resolves with the reply envelope, or fails with `Application` when the
    /// server answered with an error, `Timeout` when nothing matched in time,
    /// `Closed` when the connection dropped first, or `Superseded` in
    /// [`CorrelationMode::EventType`] when a newer request of the same type
    /// took the slot.
    pub async fn request(
        &self,
        kind: EventKind,
        mut payload: Value,
    ) -> Result<Envelope, SyncError> {
        let id = uuid::Uuid::new_v4().to_string();
        stamp_request_id(&mut payload, &id);
        let text = Envelope::new(kind, payload).to_text()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if self.mode == CorrelationMode::EventType {
                if let Some(pos) = pending.iter().position(|p| p.kind == kind) {
                    let evicted = pending.remove(pos);
                    tracing::debug!(
                        event = %kind,
                        request_id = %evicted.id,
                        "pending request superseded"
                    );
                    let _ = evicted.tx.send(Err(SyncError::Superseded(kind)));
                }
            }
            pending.push(Pending { id: id.clone(), kind, tx });
        }

        if let Err(e) = self.connection.send_text(text) {
            self.forget(&id);
            return Err(e);
        }
        tracing::debug!(event = %kind, request_id = %id, "request sent");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Closed),
            Err(_) => {
                self.forget(&id);
                tracing::warn!(event = %kind, request_id = %id, "request timed out");
                Err(SyncError::Timeout { kind, after: self.timeout })
            }
        }
    }

    /// Hand an inbound envelope to its waiter. Returns `true` if one matched.
    ///
    /// In request-id mode a reply without any id falls back to the oldest
    /// pending request of the same type.
    pub fn resolve(&self, envelope: &Envelope) -> bool {
        let Ok(kind) = envelope.event_kind() else {
            return false;
        };

        let entry = {
            let mut pending = self.pending.lock();
            let pos = match (self.mode, envelope.correlation_id()) {
                (CorrelationMode::RequestId, Some(id)) => pending.iter().position(|p| p.id == id),
                (CorrelationMode::RequestId, None) | (CorrelationMode::EventType, _) => {
                    pending.iter().position(|p| p.kind == kind)
                }
            };
            match pos {
                Some(pos) => pending.remove(pos),
                None => return false,
            }
        };

        let result = if envelope.is_error() {
            Err(SyncError::Application(envelope.error_message()))
        } else {
            Ok(envelope.clone())
        };
        // Waiter may have given up already.
        let _ = entry.tx.send(result);
        true
    }

    /// Fail every outstanding request with `error`.
    pub fn fail_pending(&self, error: SyncError) -> usize {
        let drained: Vec<Pending> = std::mem::take(&mut *self.pending.lock());
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(error.clone()));
        }
        if count > 0 {
            tracing::debug!(count, code = %error.code(), "failed pending requests");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn forget(&self, id: &str) {
        self.pending.lock().retain(|p| p.id != id);
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
