// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory transport for driving sessions from tests.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connection::{
    ConnectionManager, Connector, Lifecycle, ReconnectPolicy, Socket, SocketEvent,
};
use crate::dispatch::{CorrelationMode, OutboundDispatcher};
use crate::protocol::{Envelope, EventKind};

const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Scripted [`Connector`]: each successful connect hands a [`MockPeer`] to the
/// paired [`MockServer`].
pub struct MockConnector {
    peers: mpsc::UnboundedSender<MockPeer>,
    fail_from: Mutex<Option<usize>>,
    connects: Mutex<Vec<(Instant, String)>>,
}

pub struct MockServer {
    peers: mpsc::UnboundedReceiver<MockPeer>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, MockServer) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers,
            fail_from: Mutex::new(None),
            connects: Mutex::new(Vec::new()),
        });
        (connector, MockServer { peers: rx })
    }

    /// Refuse every connect after the first `n` calls.
    pub fn refuse_after(&self, n: usize) {
        *self.fail_from.lock() = Some(n);
    }

    /// When and where each connect was attempted.
    pub fn connects(&self) -> Vec<(Instant, String)> {
        self.connects.lock().clone()
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, anyhow::Result<Socket>> {
        let index = {
            let mut connects = self.connects.lock();
            connects.push((Instant::now(), url.to_owned()));
            connects.len() - 1
        };
        let refuse = matches!(*self.fail_from.lock(), Some(n) if index >= n);
        let peers = self.peers.clone();

        Box::pin(async move {
            if refuse {
                anyhow::bail!("connection refused");
            }
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let (frames_tx, frames_rx) = mpsc::unbounded_channel();

            // Relay client writes to the peer; a dropped writer closes the socket.
            let closer = in_tx.clone();
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if frames_tx.send(text).is_err() {
                        break;
                    }
                }
                let _ = closer.send(SocketEvent::Closed);
            });

            peers
                .send(MockPeer { to_client: in_tx, from_client: frames_rx })
                .map_err(|_| anyhow::anyhow!("mock server dropped"))?;
            Ok(Socket { outbound: out_tx, inbound: in_rx })
        })
    }
}

impl MockServer {
    pub async fn accept(&mut self) -> anyhow::Result<MockPeer> {
        tokio::time::timeout(RECV_TIMEOUT, self.peers.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("connector dropped"))
    }
}

/// Server side of one mock socket.
pub struct MockPeer {
    to_client: mpsc::UnboundedSender<SocketEvent>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MockPeer {
    /// Next frame written by the client.
    pub async fn recv_envelope(&mut self) -> anyhow::Result<Envelope> {
        let text = tokio::time::timeout(RECV_TIMEOUT, self.from_client.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("client closed"))?;
        Ok(Envelope::parse(&text)?)
    }

    /// Receive frames until one of `kind` arrives, returning it and the skipped ones.
    pub async fn recv_kind(
        &mut self,
        kind: EventKind,
    ) -> anyhow::Result<(Envelope, Vec<Envelope>)> {
        let mut skipped = Vec::new();
        loop {
            let env = self.recv_envelope().await?;
            if env.kind == kind.as_str() {
                return Ok((env, skipped));
            }
            skipped.push(env);
        }
    }

    /// Frames already written by the client, without waiting.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            if let Ok(env) = Envelope::parse(&text) {
                out.push(env);
            }
        }
        out
    }

    /// Answer `request`, echoing its request id at envelope level.
    pub fn reply(&self, request: &Envelope, payload: Value) -> anyhow::Result<()> {
        let mut env = Envelope { payload, ..request.clone() };
        env.request_id = request.correlation_id().map(str::to_owned);
        self.send_envelope(&env)
    }

    /// Answer `request` without any request id.
    pub fn reply_untagged(&self, request: &Envelope, payload: Value) -> anyhow::Result<()> {
        let env = Envelope {
            kind: request.kind.clone(),
            ..Envelope::new(EventKind::PingServer, payload)
        };
        self.send_envelope(&env)
    }

    /// Answer `request` with `status: "error"`.
    pub fn reply_error(&self, request: &Envelope, message: &str) -> anyhow::Result<()> {
        let mut env = Envelope { payload: Value::Null, ..request.clone() };
        env.request_id = request.correlation_id().map(str::to_owned);
        env.status = Some("error".to_owned());
        env.error = Some(message.to_owned());
        self.send_envelope(&env)
    }

    /// Push an unsolicited broadcast.
    pub fn push(&self, kind: EventKind, payload: Value) -> anyhow::Result<()> {
        self.send_envelope(&Envelope::new(kind, payload))
    }

    pub fn send_raw(&self, text: &str) -> anyhow::Result<()> {
        self.to_client
            .send(SocketEvent::Text(text.to_owned()))
            .map_err(|_| anyhow::anyhow!("client gone"))
    }

    /// Close from the server side.
    pub fn close(&self) {
        let _ = self.to_client.send(SocketEvent::Closed);
    }

    /// Report a transport error followed by a close.
    pub fn fail(&self, reason: &str) {
        let _ = self.to_client.send(SocketEvent::Error(reason.to_owned()));
        let _ = self.to_client.send(SocketEvent::Closed);
    }

    fn send_envelope(&self, env: &Envelope) -> anyhow::Result<()> {
        self.send_raw(&env.to_text()?)
    }
}

/// A dispatcher on an open mock connection, with inbound frames routed to it.
pub struct Wired {
    pub connection: Arc<ConnectionManager>,
    pub dispatcher: Arc<OutboundDispatcher>,
    pub peer: MockPeer,
}

pub async fn wired(mode: CorrelationMode, timeout: Duration) -> anyhow::Result<Wired> {
    let (connector, mut server) = MockConnector::new();
    let (connection, mut events) =
        ConnectionManager::new(connector, ReconnectPolicy::default(), CancellationToken::new());
    let connection = Arc::new(connection);
    let dispatcher = Arc::new(OutboundDispatcher::new(Arc::clone(&connection), mode, timeout));

    connection.open("ws://arena/ws");
    let peer = server.accept().await?;
    connection.watch().wait_for(|s| s.is_open()).await?;

    let router = Arc::clone(&dispatcher);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Lifecycle::Message { text, .. } = event {
                if let Ok(env) = Envelope::parse(&text) {
                    router.resolve(&env);
                }
            }
        }
    });

    Ok(Wired { connection, dispatcher, peer })
}
