// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;
use tokio::time::Instant;

use super::*;
use crate::error::ErrorCode;
use crate::overlay::OverlayKind;
use crate::test_support::{MockConnector, MockPeer, MockServer};

const WAIT: Duration = Duration::from_secs(30);

fn test_config() -> SyncConfig {
    let mut config = SyncConfig::new("ws://arena/ws", "auth-abc", "u1", "c1");
    config.password = "hunter2".to_owned();
    config.profile_pic = "https://cdn/u1.png".to_owned();
    // Keep the latency probe out of the way.
    config.ping_interval_ms = 3_600_000;
    config.backoff_base_ms = 10;
    config
}

struct Room {
    session: Arc<ChallengeSession>,
    notices: broadcast::Receiver<SessionNotice>,
    connector: Arc<MockConnector>,
    server: MockServer,
    peer: MockPeer,
}

async fn start(config: SyncConfig) -> anyhow::Result<Room> {
    let (connector, mut server) = MockConnector::new();
    let session = ChallengeSession::start(config, connector.clone());
    let notices = session.notices();
    let peer = server.accept().await?;
    Ok(Room { session, notices, connector, server, peer })
}

fn join_reply() -> Value {
    json!({
        "challengeToken": "tok-123",
        "challenge": { "title": "Weekly Sprint", "creatorId": "u9", "status": "WAITING" },
    })
}

fn participants(ids: &[&str]) -> Value {
    let map: serde_json::Map<String, Value> = ids
        .iter()
        .map(|id| ((*id).to_owned(), json!({ "userId": id, "status": "ACTIVE" })))
        .collect();
    json!({ "participants": map })
}

/// Answer the five hydration reads; `score` tags the leaderboard reply.
async fn answer_reads(peer: &mut MockPeer, score: i64) -> anyhow::Result<Vec<Envelope>> {
    let mut requests = Vec::new();
    while requests.len() < EventKind::HYDRATION.len() {
        let req = peer.recv_envelope().await?;
        let payload = match req.event_kind()? {
            EventKind::GetChallengeMin => {
                json!({ "title": "Weekly Sprint", "timeLimit": 1800 })
            }
            EventKind::GetParticipantsData => participants(&["u1", "u9"]),
            EventKind::GetChat => {
                json!({ "chat": [{ "userId": "u9", "message": "hi", "time": 1 }] })
            }
            EventKind::GetNotifications => {
                json!({ "notifications": [{ "message": "u1 joined" }] })
            }
            EventKind::GetLeaderboard => {
                json!({ "leaderboard": [{ "userId": "u9", "score": score }] })
            }
            other => anyhow::bail!("unexpected {other} during hydration"),
        };
        peer.reply(&req, payload)?;
        requests.push(req);
    }
    Ok(requests)
}

/// Answer the join handshake and all five hydration fetches.
async fn hydrate(peer: &mut MockPeer) -> anyhow::Result<Vec<Envelope>> {
    let (join, _) = peer.recv_kind(EventKind::JoinChallenge).await?;
    peer.reply(&join, join_reply())?;
    answer_reads(peer, 10).await
}

async fn hydrated(session: &ChallengeSession) -> anyhow::Result<ChallengeSnapshot> {
    let mut rx = session.watch_snapshot();
    let snapshot = tokio::time::timeout(
        WAIT,
        rx.wait_for(|s| {
            s.participants.len() == 2
                && s.chat.len() == 1
                && s.notifications.len() == 1
                && s.leaderboard.len() == 1
                && s.time_limit.is_some()
        }),
    )
    .await??
    .clone();
    Ok(snapshot)
}

async fn wait_snapshot(
    session: &ChallengeSession,
    pred: impl FnMut(&ChallengeSnapshot) -> bool,
) -> anyhow::Result<ChallengeSnapshot> {
    let mut rx = session.watch_snapshot();
    let snapshot = tokio::time::timeout(WAIT, rx.wait_for(pred)).await??.clone();
    Ok(snapshot)
}

async fn next_notice(
    notices: &mut broadcast::Receiver<SessionNotice>,
    pred: impl Fn(&SessionNotice) -> bool,
) -> anyhow::Result<SessionNotice> {
    tokio::time::timeout(WAIT, async {
        loop {
            let notice = notices.recv().await?;
            if pred(&notice) {
                return Ok(notice);
            }
        }
    })
    .await?
}

fn chat_lines(snapshot: &ChallengeSnapshot) -> Vec<&str> {
    snapshot.chat.iter().map(|c| c.message.as_str()).collect()
}

#[tokio::test]
async fn join_then_hydrate_with_session_token() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;

    let (join, before) = room.peer.recv_kind(EventKind::JoinChallenge).await?;
    assert!(before.is_empty());
    assert_eq!(join.payload["userId"], "u1");
    assert_eq!(join.payload["challengeId"], "c1");
    assert_eq!(join.payload["password"], "hunter2");
    assert_eq!(join.payload["token"], "Bearer auth-abc");

    // Nothing else goes out until the join is answered.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(room.peer.drain().is_empty());
    assert!(room.connector.connects()[0].1.contains("token=auth-abc"));

    room.peer.reply(&join, join_reply())?;
    let mut kinds = Vec::new();
    for _ in 0..EventKind::HYDRATION.len() {
        let req = room.peer.recv_envelope().await?;
        assert_eq!(req.payload["challengeToken"], "tok-123");
        assert_eq!(req.payload["userId"], "u1");
        assert_eq!(req.payload["challengeId"], "c1");
        kinds.push(req.event_kind()?);
    }
    kinds.sort();
    let mut expected = EventKind::HYDRATION.to_vec();
    expected.sort();
    assert_eq!(kinds, expected);

    let joined =
        next_notice(&mut room.notices, |n| matches!(n, SessionNotice::Joined { .. })).await?;
    assert_eq!(joined, SessionNotice::Joined { title: Some("Weekly Sprint".to_owned()) });
    let snapshot = room.session.snapshot();
    assert_eq!(snapshot.challenge_token.as_deref(), Some("tok-123"));
    assert_eq!(snapshot.creator_id.as_deref(), Some("u9"));
    assert_eq!(room.session.status(), "open");
    Ok(())
}

#[tokio::test]
async fn hydration_fills_every_slice() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    hydrate(&mut room.peer).await?;

    let snapshot = hydrated(&room.session).await?;
    assert_eq!(snapshot.title.as_deref(), Some("Weekly Sprint"));
    assert_eq!(snapshot.time_limit, Some(1800));
    assert_eq!(snapshot.chat[0].message, "hi");
    assert_eq!(snapshot.leaderboard[0].score, 10);
    assert!(room.session.last_error().is_none());
    Ok(())
}

#[tokio::test]
async fn refetch_all_reissues_the_five_reads() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    hydrate(&mut room.peer).await?;
    hydrated(&room.session).await?;

    let session = Arc::clone(&room.session);
    let refetch = tokio::spawn(async move { session.refetch_all().await });
    let requests = answer_reads(&mut room.peer, 99).await?;
    assert_eq!(refetch.await?, Ok(()));

    let mut kinds: Vec<_> = requests.iter().map(|r| r.event_kind()).collect::<Result<_, _>>()?;
    kinds.sort();
    let mut expected = EventKind::HYDRATION.to_vec();
    expected.sort();
    assert_eq!(kinds, expected);
    for req in &requests {
        assert_eq!(req.payload["challengeToken"], "tok-123");
    }

    let snapshot = room.session.snapshot();
    assert_eq!(snapshot.leaderboard[0].score, 99);
    assert_eq!(chat_lines(&snapshot), vec!["hi"]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(room.peer.drain().is_empty());
    Ok(())
}

#[tokio::test]
async fn refetch_broadcast_rehydrates() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    hydrate(&mut room.peer).await?;
    hydrated(&room.session).await?;

    room.peer.push(EventKind::RefetchChallenge, json!({}))?;
    let requests = answer_reads(&mut room.peer, 42).await?;
    assert!(requests.iter().all(|r| r.payload["challengeToken"] == "tok-123"));

    let snapshot =
        wait_snapshot(&room.session, |s| s.leaderboard.first().is_some_and(|e| e.score == 42))
            .await?;
    assert_eq!(snapshot.participants.len(), 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(room.peer.drain().is_empty());
    Ok(())
}

#[tokio::test]
async fn presence_broadcast_refetches_participants_once() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    hydrate(&mut room.peer).await?;
    let before = hydrated(&room.session).await?;

    room.peer.push(EventKind::UserJoined, json!({ "userId": "u2" }))?;
    let notice =
        next_notice(&mut room.notices, |n| matches!(n, SessionNotice::Presence { .. })).await?;
    let expected =
        SessionNotice::Presence { kind: EventKind::UserJoined, user_id: Some("u2".to_owned()) };
    assert_eq!(notice, expected);

    let req = room.peer.recv_envelope().await?;
    assert_eq!(req.event_kind()?, EventKind::GetParticipantsData);
    assert_eq!(req.payload["challengeToken"], "tok-123");
    room.peer.reply(&req, participants(&["u1", "u2", "u9"]))?;

    let after = wait_snapshot(&room.session, |s| s.participants.len() == 3).await?;
    assert!(after.participants.contains_key("u2"));
    assert_eq!(after.chat, before.chat);
    assert_eq!(after.leaderboard, before.leaderboard);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(room.peer.drain().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn creator_abandon_counts_down_from_five() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    hydrate(&mut room.peer).await?;
    hydrated(&room.session).await?;

    let started = Instant::now();
    room.peer.push(EventKind::CreatorAbandon, json!({ "userId": "u9" }))?;
    next_notice(&mut room.notices, |n| *n == SessionNotice::Abandoned).await?;
    let overlay = room.session.overlay();
    assert_eq!(overlay.kind, Some(OverlayKind::Abandoned));
    assert!(overlay.visible);
    assert_eq!(overlay.countdown, 5);

    let away =
        next_notice(&mut room.notices, |n| matches!(n, SessionNotice::NavigateAway { .. }))
            .await?;
    assert_eq!(away, SessionNotice::NavigateAway { overlay: OverlayKind::Abandoned });
    assert_eq!(started.elapsed().as_secs(), 5);
    let overlay = room.session.overlay();
    assert_eq!(overlay.countdown, 0);
    assert!(overlay.navigate);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn game_finished_shows_final_leaderboard() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    hydrate(&mut room.peer).await?;
    hydrated(&room.session).await?;

    let started = Instant::now();
    room.peer.push(
        EventKind::GameFinished,
        json!({ "finalLeaderboard": [
            { "userId": "u1", "score": 30, "rank": 1 },
            { "userId": "u9", "score": 20, "rank": 2 },
        ]}),
    )?;
    next_notice(&mut room.notices, |n| *n == SessionNotice::Finished).await?;

    let snapshot = room.session.snapshot();
    assert_eq!(snapshot.status.as_deref(), Some("FINISHED"));
    let ranked: Vec<_> =
        snapshot.leaderboard.iter().map(|e| (e.user_id.as_str(), e.rank)).collect();
    assert_eq!(ranked, vec![("u1", Some(1)), ("u9", Some(2))]);
    assert_eq!(room.session.overlay().countdown, 10);

    next_notice(&mut room.notices, |n| matches!(n, SessionNotice::NavigateAway { .. })).await?;
    assert_eq!(started.elapsed().as_secs(), 10);
    Ok(())
}

#[tokio::test]
async fn join_error_reports_and_skips_hydration() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    let (join, _) = room.peer.recv_kind(EventKind::JoinChallenge).await?;
    room.peer.reply_error(&join, "wrong password")?;

    let failed =
        next_notice(&mut room.notices, |n| matches!(n, SessionNotice::JoinFailed { .. })).await?;
    assert_eq!(failed.code(), Some(ErrorCode::Application));
    let expected = SyncError::Application("wrong password".to_owned());
    assert_eq!(room.session.last_error(), Some(expected));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(room.peer.drain().is_empty());
    assert!(room.session.snapshot().challenge_token.is_none());
    Ok(())
}

#[tokio::test]
async fn token_gated_actions_fail_before_join() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    let (_join, _) = room.peer.recv_kind(EventKind::JoinChallenge).await?;

    assert_eq!(room.session.send_chat("hello"), Err(SyncError::AuthExpired));
    assert_eq!(room.session.force_start(), Err(SyncError::AuthExpired));
    assert!(room.session.snapshot().chat.is_empty());

    // Refetch re-runs the handshake instead of sending unauthenticated reads.
    assert_eq!(room.session.refetch_all().await, Err(SyncError::AuthExpired));
    let (rejoin, skipped) = room.peer.recv_kind(EventKind::JoinChallenge).await?;
    assert!(skipped.is_empty());
    assert_eq!(rejoin.payload["token"], "Bearer auth-abc");
    Ok(())
}

#[tokio::test]
async fn chat_is_sent_then_echoed_once() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    hydrate(&mut room.peer).await?;
    hydrated(&room.session).await?;

    let rejected = SyncError::Rejected("empty chat message".to_owned());
    assert_eq!(room.session.send_chat("   "), Err(rejected));
    room.session.send_chat("  gl hf ")?;

    let sent = room.peer.recv_envelope().await?;
    assert_eq!(sent.event_kind()?, EventKind::PushNewChat);
    assert_eq!(sent.payload["message"], "gl hf");
    assert_eq!(sent.payload["profilePic"], "https://cdn/u1.png");
    assert_eq!(sent.payload["challengeToken"], "tok-123");

    let chat = room.session.snapshot().chat;
    assert_eq!(chat.len(), 2);
    assert_eq!(chat[1].user_id, "u1");
    assert_eq!(chat[1].message, "gl hf");

    // The server echo of our own line is ignored; other users' lines append.
    let own = json!({ "userId": "u1", "message": "gl hf", "time": chat[1].time });
    room.peer.push(EventKind::ChatMessage, own)?;
    let other = json!({ "userId": "u9", "message": "you too", "time": 2 });
    room.peer.push(EventKind::ChatMessage, other)?;
    let snapshot = wait_snapshot(&room.session, |s| s.chat.len() >= 3).await?;
    assert_eq!(chat_lines(&snapshot), vec!["hi", "gl hf", "you too"]);
    Ok(())
}

#[tokio::test]
async fn repeated_chat_lines_are_all_kept() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    hydrate(&mut room.peer).await?;
    hydrated(&room.session).await?;

    room.session.send_chat("gg")?;
    room.session.send_chat("gg")?;
    let line = json!({ "userId": "u9", "message": "lol", "time": 5 });
    room.peer.push(EventKind::ChatMessage, line.clone())?;
    room.peer.push(EventKind::ChatMessage, line)?;

    let snapshot = wait_snapshot(&room.session, |s| s.chat.len() >= 5).await?;
    assert_eq!(chat_lines(&snapshot), vec!["hi", "gg", "gg", "lol", "lol"]);
    let (first, _) = room.peer.recv_kind(EventKind::PushNewChat).await?;
    let (second, _) = room.peer.recv_kind(EventKind::PushNewChat).await?;
    assert_eq!(first.payload["message"], second.payload["message"]);
    Ok(())
}

#[tokio::test]
async fn force_start_sends_challenge_started() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    hydrate(&mut room.peer).await?;
    hydrated(&room.session).await?;

    room.session.force_start()?;
    let sent = room.peer.recv_envelope().await?;
    assert_eq!(sent.event_kind()?, EventKind::ChallengeStarted);
    let expected = json!({ "userId": "u1", "challengeId": "c1", "challengeToken": "tok-123" });
    assert_eq!(sent.payload, expected);

    room.peer.push(EventKind::ChallengeStarted, json!({ "startTime": 1_700_000_000 }))?;
    let snapshot =
        wait_snapshot(&room.session, |s| s.status.as_deref() == Some("STARTED")).await?;
    assert_eq!(snapshot.start_time, Some(1_700_000_000));
    Ok(())
}

#[tokio::test]
async fn broadcasts_patch_owner_and_leaderboard() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    hydrate(&mut room.peer).await?;
    hydrated(&room.session).await?;

    room.peer.push(EventKind::NewOwnerAssigned, json!({ "userId": "u1" }))?;
    let board = json!({ "leaderboard": [{ "userId": "u1", "totalScore": 50 }] });
    room.peer.push(EventKind::LeaderboardUpdate, board)?;

    let snapshot = wait_snapshot(&room.session, |s| {
        s.creator_id.as_deref() == Some("u1")
            && s.leaderboard.first().is_some_and(|e| e.score == 50)
    })
    .await?;
    assert_eq!(snapshot.leaderboard.len(), 1);
    Ok(())
}

#[tokio::test]
async fn malformed_frames_surface_protocol_errors() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    hydrate(&mut room.peer).await?;
    hydrated(&room.session).await?;
    let is_protocol = |n: &SessionNotice| matches!(n, SessionNotice::ProtocolError { .. });

    room.peer.send_raw("{not json")?;
    let notice = next_notice(&mut room.notices, is_protocol).await?;
    assert_eq!(notice.code(), Some(ErrorCode::Protocol));

    room.peer.push(EventKind::NewOwnerAssigned, json!({}))?;
    next_notice(&mut room.notices, is_protocol).await?;

    room.peer.send_raw(r#"{"type":"SOMETHING_ELSE","payload":{}}"#)?;
    next_notice(&mut room.notices, is_protocol).await?;

    // The session keeps going.
    assert_eq!(room.session.status(), "open");
    assert_eq!(room.session.snapshot().creator_id.as_deref(), Some("u9"));
    Ok(())
}

#[tokio::test]
async fn unsolicited_error_is_an_application_notice() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    hydrate(&mut room.peer).await?;
    hydrated(&room.session).await?;

    room.peer.send_raw(r#"{"type":"PUSH_NEW_CHAT","status":"error","error":"chat disabled"}"#)?;
    let notice =
        next_notice(&mut room.notices, |n| matches!(n, SessionNotice::ApplicationError { .. }))
            .await?;
    let expected = SessionNotice::ApplicationError {
        kind: Some(EventKind::PushNewChat),
        message: "chat disabled".to_owned(),
    };
    assert_eq!(notice, expected);
    let error = SyncError::Application("chat disabled".to_owned());
    assert_eq!(room.session.last_error(), Some(error));
    Ok(())
}

#[tokio::test]
async fn reconnect_clears_token_and_rejoins_silently() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    hydrate(&mut room.peer).await?;
    hydrated(&room.session).await?;

    let mut status = room.session.watch_status();
    room.peer.close();
    tokio::time::timeout(WAIT, status.wait_for(|s| !s.is_open())).await??;
    wait_snapshot(&room.session, |s| s.challenge_token.is_none()).await?;
    assert_eq!(room.session.send_chat("anyone?"), Err(SyncError::AuthExpired));

    let mut peer = room.server.accept().await?;
    let (join, _) = peer.recv_kind(EventKind::JoinChallenge).await?;
    peer.reply(&join, json!({ "challengeToken": "tok-456", "challenge": {} }))?;
    let req = peer.recv_envelope().await?;
    assert_eq!(req.payload["challengeToken"], "tok-456");
    assert_eq!(room.connector.connects().len(), 2);

    // A loss within the reconnect budget is never shown to the user.
    while let Ok(notice) = room.notices.try_recv() {
        assert_ne!(notice.code(), Some(ErrorCode::Transport), "{notice:?}");
        assert_ne!(notice.severity(), crate::notice::Severity::Warning, "{notice:?}");
    }
    Ok(())
}

#[tokio::test]
async fn close_of_an_older_socket_keeps_the_live_token() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    hydrate(&mut room.peer).await?;
    hydrated(&room.session).await?;

    room.session.on_lifecycle(Lifecycle::Closed {
        generation: 0,
        was_open: true,
        reason: "closed locally".to_owned(),
    });

    assert_eq!(room.session.snapshot().challenge_token.as_deref(), Some("tok-123"));
    room.session.send_chat("still here")?;
    let sent = room.peer.recv_envelope().await?;
    assert_eq!(sent.payload["challengeToken"], "tok-123");
    assert!(room.session.last_error().is_none());
    Ok(())
}

#[tokio::test]
async fn shutdown_detaches_everything() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    hydrate(&mut room.peer).await?;
    hydrated(&room.session).await?;
    assert!(room.session.bus().handler_count(EventKind::ChatMessage) > 0);

    room.session.shutdown();
    assert_eq!(room.session.bus().handler_count(EventKind::ChatMessage), 0);
    let mut status = room.session.watch_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| !s.is_open())).await??;
    assert_eq!(room.session.send_chat("bye"), Err(SyncError::AuthExpired));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(room.connector.connects().len(), 1);
    Ok(())
}

#[tokio::test]
async fn participants_map_replaces_rather_than_merges() -> anyhow::Result<()> {
    let mut room = start(test_config()).await?;
    hydrate(&mut room.peer).await?;
    hydrated(&room.session).await?;

    room.peer.push(EventKind::UserLeft, json!({ "userId": "u9" }))?;
    let req = room.peer.recv_envelope().await?;
    room.peer.reply(&req, participants(&["u1"]))?;

    let snapshot = wait_snapshot(&room.session, |s| s.participants.len() == 1).await?;
    let ids: Vec<_> = snapshot.participants.keys().cloned().collect();
    assert_eq!(ids, vec!["u1".to_owned()]);
    Ok(())
}
