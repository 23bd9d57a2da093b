// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single multiplexed WebSocket connection with bounded exponential reconnect.
//!
//! [`ConnectionManager`] owns at most one live socket. A supervisor task
//! connects, pumps inbound frames to the session as [`Lifecycle`] events, and
//! on loss schedules the next attempt until the [`ReconnectPolicy`] budget is
//! spent. The socket itself is produced by a [`Connector`] so tests can swap
//! the transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;

/// How long a locally closed socket is given to acknowledge the close.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Incremented for every physical socket attempt.
    pub generation: u64,
    /// Consecutive failed attempts since the last successful open.
    pub attempt: u32,
    /// Reconnect budget spent; the manager stays closed.
    pub exhausted: bool,
}

impl ConnectionStatus {
    fn initial() -> Self {
        Self { state: ConnectionState::Closed, generation: 0, attempt: 0, exhausted: false }
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

/// Transitions and inbound traffic reported by the supervisor, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    Opened { generation: u64 },
    Message { generation: u64, text: String },
    Closed { generation: u64, was_open: bool, reason: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

// -- Transport seam ------------------------------------------------------------

/// What a transport reports back to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Text(String),
    Error(String),
    Closed,
}

/// Channel pair for one physical socket.
///
/// Dropping `outbound` asks the transport to close; the transport then
/// reports [`SocketEvent::Closed`] on `inbound`.
pub struct Socket {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens physical sockets.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, anyhow::Result<Socket>>;
}

/// Production transport over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

impl Connector for TungsteniteConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, anyhow::Result<Socket>> {
        let url = url.to_owned();
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
            let (mut write, mut read) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        out = out_rx.recv() => match out {
                            Some(text) => {
                                if let Err(e) = write.send(Message::Text(text.into())).await {
                                    let _ = in_tx.send(SocketEvent::Error(e.to_string()));
                                    let _ = in_tx.send(SocketEvent::Closed);
                                    break;
                                }
                            }
                            None => {
                                let _ = write.send(Message::Close(None)).await;
                                let _ = in_tx.send(SocketEvent::Closed);
                                break;
                            }
                        },
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                if in_tx.send(SocketEvent::Text(text.to_string())).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                let _ = in_tx.send(SocketEvent::Closed);
                                break;
                            }
                            Some(Err(e)) => {
                                let _ = in_tx.send(SocketEvent::Error(e.to_string()));
                                let _ = in_tx.send(SocketEvent::Closed);
                                break;
                            }
                            _ => {} // ping/pong/binary ignored
                        }
                    }
                }
            });

            Ok(Socket { outbound: out_tx, inbound: in_rx })
        })
    }
}

// -- Reconnect policy ----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, base: Duration::from_millis(1000) }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-indexed): `base * 2^attempt`.
    ///
    /// `None` once the budget is spent.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(self.base.saturating_mul(1u32 << attempt.min(20)))
    }
}

// -- Manager -------------------------------------------------------------------

struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
}

/// State shared between the manager handle and its supervisor task.
struct Shared {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    status_tx: watch::Sender<ConnectionStatus>,
    link: Mutex<Option<Link>>,
    events: mpsc::UnboundedSender<Lifecycle>,
    /// Bumped by every `open()`; only the newest supervisor writes status.
    epoch: AtomicU64,
}

impl Shared {
    fn set_status(&self, epoch: u64, f: impl FnOnce(&mut ConnectionStatus)) {
        self.status_tx.send_if_modified(|s| {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            f(s);
            true
        });
    }

    /// Drop the link if it still belongs to `generation`.
    fn release_link(&self, generation: u64) {
        let mut link = self.link.lock();
        if link.as_ref().is_some_and(|l| l.generation == generation) {
            link.take();
        }
    }

    fn report(&self, event: Lifecycle) {
        // The session may already be gone; nothing to do then.
        let _ = self.events.send(event);
    }
}

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owner of the one live connection.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Create a manager. Lifecycle events arrive on the returned receiver.
    ///
    /// `cancel` is the parent token; cancelling it tears down any supervisor.
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Lifecycle>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ConnectionStatus::initial());
        let shared = Arc::new(Shared {
            connector,
            policy,
            status_tx,
            link: Mutex::new(None),
            events,
            epoch: AtomicU64::new(0),
        });
        (Self { shared, supervisor: Mutex::new(None), cancel }, events_rx)
    }

    /// Get-or-create the connection.
    ///
    /// While a supervisor is alive (connecting, open, or waiting out a backoff)
    /// this is a no-op returning the current status. After `close()` or an
    /// exhausted budget it starts a fresh supervisor with a zeroed counter.
    /// The fresh supervisor connects only once the previous one has finished.
    pub fn open(&self, url: &str) -> ConnectionStatus {
        let mut supervisor = self.supervisor.lock();
        if let Some(ref current) = *supervisor {
            if !current.cancel.is_cancelled() && !self.status().exhausted {
                return self.status();
            }
        }

        let previous = supervisor.take().map(|s| {
            s.cancel.cancel();
            s.task
        });
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.set_status(epoch, |s| {
            s.state = ConnectionState::Connecting;
            s.attempt = 0;
            s.exhausted = false;
        });

        let cancel = self.cancel.child_token();
        let task = tokio::spawn(supervise(
            Arc::clone(&self.shared),
            url.to_owned(),
            epoch,
            previous,
            cancel.clone(),
        ));
        *supervisor = Some(Supervisor { cancel, task });
        self.status()
    }

    /// Close the connection and cancel any pending reconnect.
    pub fn close(&self) {
        if let Some(ref current) = *self.supervisor.lock() {
            current.cancel.cancel();
        }
    }

    /// Write one text frame to the live socket.
    ///
    /// Returns the generation the frame was written on.
    pub fn send_text(&self, text: String) -> Result<u64, SyncError> {
        let link = self.shared.link.lock();
        match link.as_ref() {
            Some(link) => {
                link.outbound
                    .send(text)
                    .map_err(|_| SyncError::Transport("socket writer gone".to_owned()))?;
                Ok(link.generation)
            }
            None => Err(SyncError::Transport(format!("connection is {}", self.status().state))),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Generation of the open socket, if any.
    pub fn generation(&self) -> Option<u64> {
        self.shared.link.lock().as_ref().map(|l| l.generation)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// How one socket ended.
enum SocketEnd {
    Local,
    Remote { errored: bool, reason: String },
}

async fn supervise(
    shared: Arc<Shared>,
    url: String,
    epoch: u64,
    previous: Option<JoinHandle<()>>,
    cancel: CancellationToken,
) {
    // The previous socket must be fully closed before a new one is dialed.
    if let Some(previous) = previous {
        tokio::select! {
            _ = cancel.cancelled() => {
                shared.set_status(epoch, |s| s.state = ConnectionState::Closed);
                return;
            }
            _ = previous => {}
        }
    }

    let mut attempt: u32 = 0;

    loop {
        let generation = {
            let mut next = 0;
            shared.status_tx.send_modify(|s| {
                s.generation += 1;
                next = s.generation;
            });
            shared.set_status(epoch, |s| {
                s.state = ConnectionState::Connecting;
                s.attempt = attempt;
            });
            next
        };
        tracing::debug!(generation, attempt, "connecting");

        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = shared.connector.connect(&url) => result,
        };

        match connected {
            Ok(socket) => {
                attempt = 0;
                let Socket { outbound, inbound } = socket;
                *shared.link.lock() = Some(Link { generation, outbound });
                shared.set_status(epoch, |s| {
                    s.state = ConnectionState::Open;
                    s.attempt = 0;
                });
                tracing::info!(generation, "connection open");
                shared.report(Lifecycle::Opened { generation });

                let end = pump(&shared, epoch, inbound, generation, &cancel).await;
                shared.release_link(generation);

                match end {
                    SocketEnd::Local => {
                        shared.set_status(epoch, |s| s.state = ConnectionState::Closed);
                        shared.report(Lifecycle::Closed {
                            generation,
                            was_open: true,
                            reason: "closed locally".to_owned(),
                        });
                        tracing::info!(generation, "connection closed locally");
                        return;
                    }
                    SocketEnd::Remote { errored, reason } => {
                        if errored {
                            shared.set_status(epoch, |s| s.state = ConnectionState::Error);
                        }
                        shared.set_status(epoch, |s| s.state = ConnectionState::Closed);
                        tracing::warn!(generation, reason = %reason, "connection lost");
                        shared.report(Lifecycle::Closed { generation, was_open: true, reason });
                    }
                }
            }
            Err(e) => {
                shared.set_status(epoch, |s| s.state = ConnectionState::Error);
                shared.set_status(epoch, |s| s.state = ConnectionState::Closed);
                tracing::debug!(generation, err = %e, "connect failed");
                shared.report(Lifecycle::Closed {
                    generation,
                    was_open: false,
                    reason: e.to_string(),
                });
            }
        }

        attempt += 1;
        let Some(delay) = shared.policy.delay(attempt) else {
            let attempts = attempt - 1;
            shared.set_status(epoch, |s| {
                s.state = ConnectionState::Closed;
                s.attempt = attempts;
                s.exhausted = true;
            });
            tracing::warn!(attempts, "reconnect budget exhausted");
            shared.report(Lifecycle::Exhausted { attempts });
            return;
        };

        shared.set_status(epoch, |s| s.attempt = attempt);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        shared.report(Lifecycle::ReconnectScheduled { attempt, delay });

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // Cancelled while connecting or backing off.
    shared.set_status(epoch, |s| s.state = ConnectionState::Closed);
}

async fn pump(
    shared: &Shared,
    epoch: u64,
    mut inbound: mpsc::UnboundedReceiver<SocketEvent>,
    generation: u64,
    cancel: &CancellationToken,
) -> SocketEnd {
    let mut errored = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Dropping the writer asks the transport to close; wait briefly for it.
                shared.release_link(generation);
                let _ = tokio::time::timeout(CLOSE_GRACE, async {
                    while let Some(event) = inbound.recv().await {
                        if event == SocketEvent::Closed {
                            break;
                        }
                    }
                })
                .await;
                return SocketEnd::Local;
            }
            event = inbound.recv() => match event {
                Some(SocketEvent::Text(text)) => {
                    shared.report(Lifecycle::Message { generation, text });
                }
                Some(SocketEvent::Error(reason)) => {
                    tracing::debug!(generation, err = %reason, "socket error");
                    errored = true;
                    shared.set_status(epoch, |s| s.state = ConnectionState::Error);
                }
                Some(SocketEvent::Closed) => {
                    return SocketEnd::Remote { errored, reason: "closed by peer".to_owned() };
                }
                None => {
                    let reason = "transport dropped".to_owned();
                    return SocketEnd::Remote { errored: true, reason };
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
