// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-of-session overlays with a navigate-away countdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::notice::SessionNotice;

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayKind {
    /// The creator left the room for good.
    Abandoned,
    /// The game ended; final standings are in.
    Finished,
}

impl OverlayKind {
    pub fn countdown_secs(&self) -> u32 {
        match self {
            Self::Abandoned => 5,
            Self::Finished => 10,
        }
    }
}

/// What the UI renders on top of the room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overlay {
    pub kind: Option<OverlayKind>,
    pub visible: bool,
    /// Seconds left before the caller must navigate away.
    pub countdown: u32,
    /// Set once the countdown reaches zero; never cleared.
    pub navigate: bool,
}

/// Owns the overlay state and at most one running countdown.
pub struct OverlayController {
    state: Arc<watch::Sender<Overlay>>,
    notices: broadcast::Sender<SessionNotice>,
    running: Mutex<Option<CancellationToken>>,
    cancel: CancellationToken,
}

impl OverlayController {
    pub fn new(notices: broadcast::Sender<SessionNotice>, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(Overlay::default());
        Self { state: Arc::new(state), notices, running: Mutex::new(None), cancel }
    }

    /// Show `kind` and start its countdown, replacing any countdown in flight.
    pub fn show(&self, kind: OverlayKind) {
        let token = self.cancel.child_token();
        if let Some(previous) = self.running.lock().replace(token.clone()) {
            previous.cancel();
        }

        let secs = kind.countdown_secs();
        self.state.send_replace(Overlay {
            kind: Some(kind),
            visible: true,
            countdown: secs,
            navigate: false,
        });
        tracing::info!(?kind, secs, "overlay shown");

        let state = Arc::clone(&self.state);
        let notices = self.notices.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + TICK, TICK);
            let mut remaining = secs;
            while remaining > 0 {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticks.tick() => {}
                }
                remaining -= 1;
                state.send_modify(|o| {
                    o.countdown = remaining;
                    o.navigate = remaining == 0;
                });
            }
            tracing::info!(?kind, "overlay countdown finished");
            let _ = notices.send(SessionNotice::NavigateAway { overlay: kind });
        });
    }

    pub fn current(&self) -> Overlay {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Overlay> {
        self.state.subscribe()
    }

    /// Stop any countdown without touching the visible state.
    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
#[path = "overlay_tests.rs"]
mod tests;
