// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One challenge room session, end to end.
//!
//! On every `Open` the session runs the join handshake, stores the session
//! token against that connection generation, and fans out the five hydration
//! fetches. Each fetch merges its own slice of the snapshot when it lands.
//! Broadcasts arrive through the [`EventBus`] and either patch the snapshot
//! directly or trigger a targeted refetch.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, SubscriptionId};
use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, ConnectionStatus, Connector, Lifecycle};
use crate::dispatch::OutboundDispatcher;
use crate::error::SyncError;
use crate::latency::{LatencyGrade, LatencyProbe};
use crate::metadata::MetadataClient;
use crate::notice::SessionNotice;
use crate::overlay::{Overlay, OverlayController, OverlayKind};
use crate::protocol::{
    build_ws_url, decode_payload, epoch_secs, ChallengeMeta, ChatEntry, ChatReply, Envelope,
    EventKind, JoinReply, LeaderboardReply, NotificationsReply, ParticipantsReply, ServerEvent,
};
use crate::snapshot::{ChallengeSnapshot, SnapshotPatch};
use crate::token::SessionTokenStore;

const NOTICE_CAPACITY: usize = 64;

pub struct ChallengeSession {
    config: SyncConfig,
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<OutboundDispatcher>,
    bus: Arc<EventBus>,
    tokens: SessionTokenStore,
    probe: Arc<LatencyProbe>,
    overlay: OverlayController,
    metadata: Option<MetadataClient>,
    snapshot: watch::Sender<ChallengeSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
    last_error: Mutex<Option<SyncError>>,
    subscriptions: Mutex<Vec<(EventKind, SubscriptionId)>>,
    cancel: CancellationToken,
}

impl ChallengeSession {
    /// Build the session, wire its subscriptions, and open the connection.
    pub fn start(config: SyncConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let (connection, lifecycle) =
            ConnectionManager::new(connector, config.reconnect_policy(), cancel.child_token());
        let connection = Arc::new(connection);
        let dispatcher = Arc::new(OutboundDispatcher::new(
            Arc::clone(&connection),
            config.correlation,
            config.request_timeout(),
        ));
        let probe = Arc::new(LatencyProbe::new(Arc::clone(&dispatcher), config.ping_interval()));
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let overlay = OverlayController::new(notices.clone(), cancel.child_token());
        let tokens = match config.token_file {
            Some(ref path) => SessionTokenStore::with_file(path.clone()),
            None => SessionTokenStore::in_memory(),
        };
        let metadata =
            config.api_url.clone().map(|url| {
                MetadataClient::new(url, Some(config.auth_token.clone()))
            });
        let (snapshot, _) = watch::channel(ChallengeSnapshot::default());

        let session = Arc::new(Self {
            config,
            connection,
            dispatcher,
            bus: Arc::new(EventBus::new()),
            tokens,
            probe,
            overlay,
            metadata,
            snapshot,
            notices,
            last_error: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            cancel,
        });

        session.subscribe_broadcasts();
        session.probe.spawn(session.connection.watch(), session.cancel.child_token());
        tokio::spawn(run(Arc::downgrade(&session), lifecycle, session.cancel.clone()));

        match build_ws_url(&session.config.url, &session.config.auth_token) {
            Ok(url) => {
                session.connection.open(&url);
            }
            Err(e) => {
                tracing::error!(err = %e, "cannot open room socket");
                session.set_error(e);
            }
        }
        tracing::info!(
            challenge_id = %session.config.challenge_id,
            user_id = %session.config.user_id,
            "session started"
        );
        session
    }

    // -- Read model ------------------------------------------------------------

    pub fn snapshot(&self) -> ChallengeSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<ChallengeSnapshot> {
        self.snapshot.subscribe()
    }

    /// Connection status string for display.
    pub fn status(&self) -> &'static str {
        self.connection.status().state.as_str()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.watch()
    }

    pub fn latency(&self) -> Option<Duration> {
        self.probe.latest()
    }

    pub fn watch_latency(&self) -> watch::Receiver<Option<Duration>> {
        self.probe.watch()
    }

    pub fn latency_grade(&self) -> Option<LatencyGrade> {
        self.probe.grade()
    }

    pub fn overlay(&self) -> Overlay {
        self.overlay.current()
    }

    pub fn watch_overlay(&self) -> watch::Receiver<Overlay> {
        self.overlay.watch()
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Subscription capability for UI layers.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.last_error.lock().clone()
    }

    // -- Actions ---------------------------------------------------------------

    /// Send a chat line and echo it locally right away.
    pub fn send_chat(&self, text: &str) -> Result<(), SyncError> {
        let message = text.trim();
        if message.is_empty() {
            return Err(SyncError::Rejected("empty chat message".to_owned()));
        }
        let entry = ChatEntry {
            user_id: self.config.user_id.clone(),
            profile_pic: self.config.profile_pic.clone(),
            message: message.to_owned(),
            time: epoch_secs(),
        };

        let mut payload = self.auth_payload()?;
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("profilePic".to_owned(), json!(entry.profile_pic));
            obj.insert("message".to_owned(), json!(entry.message));
        }
        self.dispatcher.send(EventKind::PushNewChat, payload)?;
        self.snapshot.send_modify(|s| s.push_chat(entry));
        Ok(())
    }

    /// Ask the server to start the challenge now.
    pub fn force_start(&self) -> Result<(), SyncError> {
        let payload = self.auth_payload()?;
        self.dispatcher.send(EventKind::ChallengeStarted, payload)
    }

    /// Re-issue all five hydration fetches.
    ///
    /// Without a live session token nothing is sent; if the socket is open the
    /// join handshake is re-run instead, which hydrates on success.
    pub async fn refetch_all(self: &Arc<Self>) -> Result<(), SyncError> {
        match self.hydrate().await {
            Err(SyncError::AuthExpired) => {
                if let Some(generation) = self.connection.generation() {
                    tracing::info!(generation, "no session token, re-joining");
                    self.spawn_join(generation);
                }
                Err(SyncError::AuthExpired)
            }
            other => other,
        }
    }

    /// Stop everything: connection, probe, countdowns, and the event loop.
    pub fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::info!("session shutting down");
        self.cancel.cancel();
        self.connection.close();
        self.overlay.stop();
        for (kind, id) in self.subscriptions.lock().drain(..) {
            self.bus.off(kind, id);
        }
        self.dispatcher.fail_pending(SyncError::Closed);
        self.tokens.clear();
    }

    // -- Handshake and hydration ----------------------------------------------

    fn spawn_join(self: &Arc<Self>, generation: u64) {
        let session = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = session.join(generation) => {}
            }
        });
    }

    async fn join(&self, generation: u64) {
        let payload = json!({
            "userId": self.config.user_id,
            "challengeId": self.config.challenge_id,
            "password": self.config.password,
            "token": self.config.bearer(),
        });

        let joined = self
            .dispatcher
            .request(EventKind::JoinChallenge, payload)
            .await
            .and_then(|reply| decode_payload::<JoinReply>(EventKind::JoinChallenge, &reply.payload))
            .and_then(|reply| {
                if reply.challenge_token.is_empty() {
                    Err(SyncError::Protocol("join reply without challengeToken".to_owned()))
                } else {
                    Ok(reply)
                }
            });

        let reply = match joined {
            Ok(reply) => reply,
            Err(e) if e.code().is_transient() => {
                tracing::debug!(generation, err = %e, "join interrupted");
                return;
            }
            Err(e) => {
                tracing::warn!(generation, err = %e, "join failed");
                self.notify(SessionNotice::JoinFailed { message: e.to_string() });
                self.set_error(e);
                return;
            }
        };

        // The socket may have cycled while the reply was in flight.
        if self.connection.generation() != Some(generation) {
            tracing::debug!(generation, "join reply for a stale connection");
            return;
        }

        self.tokens.set(&reply.challenge_token, &self.config.challenge_id, generation);
        let title = reply.challenge.title.clone();
        let problem_ids = reply.challenge.problem_ids.clone().unwrap_or_default();
        let mut patch = SnapshotPatch::from_meta(reply.challenge);
        patch.challenge_token = Some(Some(reply.challenge_token));
        self.merge(patch);
        self.last_error.lock().take();
        tracing::info!(generation, title = title.as_deref().unwrap_or(""), "joined challenge");
        self.notify(SessionNotice::Joined { title });

        let (hydrated, _) = tokio::join!(self.hydrate(), self.resolve_problems(problem_ids));
        if let Err(e) = hydrated {
            tracing::debug!(generation, err = %e, "hydration incomplete");
        }
    }

    /// Run the five granular fetches concurrently. Returns the first failure.
    async fn hydrate(&self) -> Result<(), SyncError> {
        let base = self.auth_payload()?;
        let results = tokio::join!(
            self.fetch(EventKind::GetChallengeMin, &base, SnapshotPatch::from_meta),
            self.fetch(EventKind::GetParticipantsData, &base, |r: ParticipantsReply| {
                SnapshotPatch::participants(r.participants)
            }),
            self.fetch(EventKind::GetChat, &base, |r: ChatReply| SnapshotPatch::chat(r.chat)),
            self.fetch(EventKind::GetNotifications, &base, |r: NotificationsReply| {
                SnapshotPatch::notifications(r.notifications)
            }),
            self.fetch(EventKind::GetLeaderboard, &base, |r: LeaderboardReply| {
                SnapshotPatch::leaderboard(r.leaderboard)
            }),
        );
        let (min, participants, chat, notifications, leaderboard) = results;
        min.and(participants).and(chat).and(notifications).and(leaderboard)
    }

    async fn refetch_participants(&self) -> Result<(), SyncError> {
        let base = self.auth_payload()?;
        self.fetch(EventKind::GetParticipantsData, &base, |r: ParticipantsReply| {
            SnapshotPatch::participants(r.participants)
        })
        .await
    }

    /// One authenticated request whose reply becomes one snapshot patch.
    async fn fetch<T, F>(&self, kind: EventKind, base: &Value, to_patch: F) -> Result<(), SyncError>
    where
        T: DeserializeOwned,
        F: FnOnce(T) -> SnapshotPatch,
    {
        let outcome = self
            .dispatcher
            .request(kind, base.clone())
            .await
            .and_then(|reply: Envelope| decode_payload::<T>(kind, &reply.payload));
        match outcome {
            Ok(value) => {
                self.merge(to_patch(value));
                Ok(())
            }
            Err(e) => {
                if e.code().is_transient() {
                    tracing::debug!(event = %kind, err = %e, "fetch interrupted");
                } else {
                    tracing::warn!(event = %kind, err = %e, "fetch failed");
                    self.notify(SessionNotice::ApplicationError {
                        kind: Some(kind),
                        message: e.to_string(),
                    });
                    self.set_error(e.clone());
                }
                Err(e)
            }
        }
    }

    async fn resolve_problems(&self, problem_ids: Vec<String>) {
        let Some(ref client) = self.metadata else {
            return;
        };
        if problem_ids.is_empty() {
            return;
        }
        match client.bulk_problem_metadata(&problem_ids).await {
            Ok(problems) => self.merge(SnapshotPatch::problems(problems)),
            Err(e) => tracing::warn!(err = %e, "problem metadata lookup failed"),
        }
    }

    /// `{userId, challengeId, challengeToken}` for the live connection.
    ///
    /// Fails with `AuthExpired` unless a token was issued on the current socket.
    fn auth_payload(&self) -> Result<Value, SyncError> {
        let generation = self.connection.generation().ok_or(SyncError::AuthExpired)?;
        let token = self.tokens.token_for(&self.config.challenge_id, generation)?;
        Ok(json!({
            "userId": self.config.user_id,
            "challengeId": self.config.challenge_id,
            "challengeToken": token,
        }))
    }

    // -- Inbound ---------------------------------------------------------------

    fn on_lifecycle(self: &Arc<Self>, event: Lifecycle) {
        match event {
            Lifecycle::Opened { generation } => self.spawn_join(generation),
            Lifecycle::Message { text, .. } => self.route_inbound(&text),
            Lifecycle::Closed { generation, was_open, reason } => {
                // A token issued on a newer socket outlives this close.
                if self.tokens.get().is_some_and(|t| t.generation > generation) {
                    tracing::debug!(generation, "close of a superseded connection");
                    return;
                }
                self.tokens.clear();
                self.merge(SnapshotPatch::token(None));
                self.dispatcher.fail_pending(SyncError::Closed);
                // Reconnects are silent until the budget runs out.
                if was_open {
                    tracing::warn!(generation, reason = %reason, "connection lost");
                }
            }
            Lifecycle::ReconnectScheduled { attempt, delay } => {
                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            }
            Lifecycle::Exhausted { attempts } => {
                self.set_error(SyncError::Transport(format!(
                    "gave up after {attempts} reconnect attempts"
                )));
                self.notify(SessionNotice::ReconnectExhausted { attempts });
            }
        }
    }

    fn route_inbound(&self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(err = %e, "dropping inbound frame");
                self.notify(SessionNotice::ProtocolError { detail: e.to_string() });
                return;
            }
        };

        let resolved = self.dispatcher.resolve(&envelope);
        if envelope.is_error() {
            // Requesters surface their own failures.
            if !resolved {
                let message = envelope.error_message();
                tracing::warn!(
                    event = %envelope.kind,
                    message = %message,
                    "server reported an error"
                );
                self.set_error(SyncError::Application(message.clone()));
                self.notify(SessionNotice::ApplicationError {
                    kind: envelope.event_kind().ok(),
                    message,
                });
            }
            return;
        }

        match ServerEvent::decode(&envelope) {
            Ok(event) => {
                self.bus.emit(&event);
            }
            Err(e) if resolved => {
                tracing::debug!(event = %envelope.kind, err = %e, "reply not broadcast");
            }
            Err(e) => {
                tracing::warn!(event = %envelope.kind, err = %e, "dropping inbound frame");
                self.notify(SessionNotice::ProtocolError { detail: e.to_string() });
            }
        }
    }

    fn subscribe_broadcasts(self: &Arc<Self>) {
        let presence = [
            EventKind::UserJoined,
            EventKind::UserLeft,
            EventKind::OwnerJoined,
            EventKind::OwnerLeft,
        ];
        for kind in presence {
            self.subscribe(kind, |session, event| {
                let user_id = match event {
                    ServerEvent::UserJoined(p)
                    | ServerEvent::UserLeft(p)
                    | ServerEvent::OwnerJoined(p)
                    | ServerEvent::OwnerLeft(p) => p.user_id.clone(),
                    _ => None,
                };
                session.notify(SessionNotice::Presence { kind: event.kind(), user_id });
                let session = Arc::clone(session);
                let cancel = session.cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        result = session.refetch_participants() => {
                            if let Err(e) = result {
                                tracing::debug!(err = %e, "participants refetch skipped");
                            }
                        }
                    }
                });
            });
        }

        self.subscribe(EventKind::CreatorAbandon, |session, _| {
            session.notify(SessionNotice::Abandoned);
            session.overlay.show(OverlayKind::Abandoned);
        });

        self.subscribe(EventKind::GameFinished, |session, event| {
            if let ServerEvent::GameFinished { final_leaderboard } = event {
                session.merge(SnapshotPatch {
                    status: Some("FINISHED".to_owned()),
                    leaderboard: Some(final_leaderboard.clone()),
                    ..SnapshotPatch::default()
                });
            }
            session.notify(SessionNotice::Finished);
            session.overlay.show(OverlayKind::Finished);
        });

        self.subscribe(EventKind::ChallengeStarted, |session, event| {
            if let ServerEvent::ChallengeStarted { start_time } = event {
                session.merge(SnapshotPatch::from_meta(ChallengeMeta {
                    status: Some("STARTED".to_owned()),
                    start_time: *start_time,
                    ..ChallengeMeta::default()
                }));
            }
        });

        self.subscribe(EventKind::NewOwnerAssigned, |session, event| {
            if let ServerEvent::NewOwnerAssigned { user_id } = event {
                session.merge(SnapshotPatch {
                    creator_id: Some(user_id.clone()),
                    ..SnapshotPatch::default()
                });
            }
        });

        self.subscribe(EventKind::LeaderboardUpdate, |session, event| {
            if let ServerEvent::LeaderboardUpdate { leaderboard } = event {
                session.merge(SnapshotPatch::leaderboard(leaderboard.clone()));
            }
        });

        self.subscribe(EventKind::ChatMessage, |session, event| {
            if let ServerEvent::ChatMessage(entry) = event {
                // Our own lines were already echoed locally.
                if entry.user_id == session.config.user_id {
                    return;
                }
                session.snapshot.send_modify(|s| s.push_chat(entry.clone()));
            }
        });

        self.subscribe(EventKind::RefetchChallenge, |session, _| {
            let session = Arc::clone(session);
            tokio::spawn(async move {
                let cancel = session.cancel.clone();
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = session.refetch_all() => {
                        if let Err(e) = result {
                            tracing::debug!(err = %e, "server-requested refetch failed");
                        }
                    }
                }
            });
        });
    }

    /// Register a bus handler that holds the session weakly.
    fn subscribe<F>(self: &Arc<Self>, kind: EventKind, handler: F)
    where
        F: Fn(&Arc<Self>, &ServerEvent) + Send + Sync + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = self.bus.on(kind, move |event| {
            if let Some(session) = weak.upgrade() {
                handler(&session, event);
            }
        });
        self.subscriptions.lock().push((kind, id));
    }

    // -- Helpers ---------------------------------------------------------------

    fn merge(&self, patch: SnapshotPatch) {
        self.snapshot.send_modify(|s| s.merge(patch));
    }

    fn notify(&self, notice: SessionNotice) {
        // No receivers is fine.
        let _ = self.notices.send(notice);
    }

    fn set_error(&self, error: SyncError) {
        *self.last_error.lock() = Some(error);
    }
}

impl Drop for ChallengeSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    weak: Weak<ChallengeSession>,
    mut lifecycle: mpsc::UnboundedReceiver<Lifecycle>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = lifecycle.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(session) = weak.upgrade() else {
            break;
        };
        session.on_lifecycle(event);
    }
    tracing::debug!("session event loop stopped");
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
