// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic `PING_SERVER` round-trip measurement.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionStatus;
use crate::dispatch::OutboundDispatcher;
use crate::error::SyncError;
use crate::protocol::EventKind;

/// Coarse latency bucket for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyGrade {
    Good,
    Degraded,
    Poor,
}

impl LatencyGrade {
    pub fn from_rtt(rtt: Duration) -> Self {
        match rtt.as_millis() {
            0..=149 => Self::Good,
            150..=399 => Self::Degraded,
            _ => Self::Poor,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Degraded => "degraded",
            Self::Poor => "poor",
        }
    }
}

pub struct LatencyProbe {
    dispatcher: Arc<OutboundDispatcher>,
    period: Duration,
    latest: watch::Sender<Option<Duration>>,
}

impl LatencyProbe {
    pub fn new(dispatcher: Arc<OutboundDispatcher>, period: Duration) -> Self {
        let (latest, _) = watch::channel(None);
        Self { dispatcher, period, latest }
    }

    /// Send one ping and publish its round trip once the matching reply lands.
    pub async fn probe_once(&self) -> Result<Duration, SyncError> {
        let sent_at = Instant::now();
        self.dispatcher.request(EventKind::PingServer, json!({})).await?;
        // `elapsed` saturates at zero.
        let rtt = sent_at.elapsed();
        self.latest.send_replace(Some(rtt));
        tracing::trace!(rtt_ms = rtt.as_millis() as u64, "pong");
        Ok(rtt)
    }

    /// Most recent round trip.
    pub fn latest(&self) -> Option<Duration> {
        *self.latest.borrow()
    }

    pub fn grade(&self) -> Option<LatencyGrade> {
        self.latest().map(LatencyGrade::from_rtt)
    }

    pub fn watch(&self) -> watch::Receiver<Option<Duration>> {
        self.latest.subscribe()
    }

    /// Ping every `period` while the connection is open, until `cancel` fires.
    ///
    /// Each tick runs its own probe so a slow reply never delays the next ping.
    pub fn spawn(
        self: &Arc<Self>,
        status: watch::Receiver<ConnectionStatus>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let probe = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(Instant::now() + probe.period, probe.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if !status.borrow().is_open() {
                    continue;
                }

                let tick = Arc::clone(&probe);
                let tick_cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tick_cancel.cancelled() => {}
                        result = tick.probe_once() => {
                            if let Err(e) = result {
                                tracing::debug!(err = %e, "latency probe failed");
                            }
                        }
                    }
                });
            }
        })
    }
}

#[cfg(test)]
#[path = "latency_tests.rs"]
mod tests;
