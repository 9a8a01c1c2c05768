//! End-to-end session tests on loopback.
//!
//! Each test runs a hosting session and one or more joining sessions as
//! separate `SessionService` actors sharing an in-process discovery
//! registry, exactly as two devices on the same subnet would.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use lanplay::network::{JoinFailure, RejectReason};
use lanplay::{
    DiscoveryAdapter, GameMode, LocalDiscovery, PlayerId, Room, SessionConfig, SessionContext,
    SessionController, SessionEvent, SessionHandle, SessionService, SessionState,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn spawn(nickname: &str, discovery: Arc<dyn DiscoveryAdapter>) -> SessionHandle {
    let mut config = SessionConfig::loopback(nickname);
    config.max_players = 3;
    SessionService::spawn(SessionController::new(SessionContext::new(config, discovery)))
}

/// Wait up to 5 s for an event matching `pred`.
async fn expect_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("session stopped"),
            }
        }
    })
    .await
    .expect("event timed out")
}

/// Host a room and return it as a joiner would discover it.
async fn host_room(host: &SessionHandle, registry: &LocalDiscovery, password: Option<&str>) -> Room {
    host.create_room("Den", password, GameMode::Coop).await.expect("create room");
    let mut rooms = registry.rooms();
    let rooms = tokio::time::timeout(Duration::from_secs(2), rooms.wait_for(|r| !r.is_empty()))
        .await
        .expect("room not advertised")
        .expect("registry closed");
    rooms[0].clone()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Join, exchange chat and ready flags, start, and close the room.
#[tokio::test]
async fn full_session_lifecycle() {
    let registry = LocalDiscovery::new();
    let host = spawn("alice", Arc::new(registry.peer()));
    let joiner = spawn("bob", Arc::new(registry.peer()));
    let mut host_events = host.events();
    let mut joiner_events = joiner.events();

    let room = host_room(&host, &registry, Some("abc")).await;
    assert!(room.has_password);
    assert_eq!(room.metadata["players"], "1/3");

    joiner.join_room(room, Some("abc")).await.expect("join");
    let joined = expect_event(&mut joiner_events, |e| matches!(e, SessionEvent::Joined { .. })).await;
    assert_eq!(joined, SessionEvent::Joined { player_id: PlayerId(1) });

    // Nickname reaches the host roster and the advertisement tracks occupancy
    let mut host_view = host.snapshot();
    tokio::time::timeout(
        Duration::from_secs(5),
        host_view.wait_for(|s| s.peers.iter().any(|p| p.nickname == "bob")),
    )
    .await
    .expect("nickname not applied")
    .expect("session stopped");
    let advertised = registry.rooms().borrow()[0].clone();
    assert_eq!(advertised.players, 2);

    // Chat is relayed to everyone, stamped by the host
    joiner.send_chat("hi all").await.unwrap();
    for events in [&mut host_events, &mut joiner_events] {
        match expect_event(events, |e| matches!(e, SessionEvent::Chat(_))).await {
            SessionEvent::Chat(chat) => {
                assert_eq!(chat.from, PlayerId(1));
                assert_eq!(chat.nickname, "bob");
                assert_eq!(chat.text, "hi all");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    joiner.set_ready(true).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), host_view.wait_for(|s| s.all_ready() && s.peers.len() == 2))
        .await
        .expect("ready flag not applied")
        .expect("session stopped");

    host.start_game().await.unwrap();
    let starting = expect_event(&mut joiner_events, |e| matches!(e, SessionEvent::GameStarting { .. })).await;
    assert_eq!(starting, SessionEvent::GameStarting { level: "level_1".into() });

    host.leave_room().await.unwrap();
    expect_event(&mut joiner_events, |e| matches!(e, SessionEvent::RoomClosed)).await;
    assert_eq!(joiner.snapshot().borrow().state, SessionState::Idle);
    assert!(registry.rooms().borrow().is_empty());
}

/// Wrong password is rejected by the host and the joiner returns to Idle.
#[tokio::test]
async fn wrong_password_is_rejected() {
    let registry = LocalDiscovery::new();
    let host = spawn("alice", Arc::new(registry.peer()));
    let joiner = spawn("mallory", Arc::new(registry.peer()));
    let mut joiner_events = joiner.events();

    let room = host_room(&host, &registry, Some("abc")).await;
    joiner.join_room(room, Some("guess")).await.unwrap();

    let failed = expect_event(&mut joiner_events, |e| matches!(e, SessionEvent::JoinFailed(_))).await;
    assert_eq!(failed, SessionEvent::JoinFailed(JoinFailure::Rejected(RejectReason::BadPassword)));
    assert_eq!(joiner.snapshot().borrow().state, SessionState::Idle);
    assert_eq!(host.snapshot().borrow().peers.len(), 1);

    host.leave_room().await.unwrap();
}

/// A full room turns away the next joiner.
#[tokio::test]
async fn full_room_is_rejected() {
    let registry = LocalDiscovery::new();
    let host = spawn("alice", Arc::new(registry.peer()));
    let room = host_room(&host, &registry, None).await;

    let mut joiners = Vec::new();
    for (i, nickname) in ["bob", "carol"].iter().enumerate() {
        let joiner = spawn(nickname, Arc::new(registry.peer()));
        let mut events = joiner.events();
        joiner.join_room(room.clone(), None).await.unwrap();
        let joined = expect_event(&mut events, |e| matches!(e, SessionEvent::Joined { .. })).await;
        assert_eq!(joined, SessionEvent::Joined { player_id: PlayerId(i as u8 + 1) });
        joiners.push(joiner);
    }

    let late = spawn("dave", Arc::new(registry.peer()));
    let mut events = late.events();
    late.join_room(room, None).await.unwrap();
    let failed = expect_event(&mut events, |e| matches!(e, SessionEvent::JoinFailed(_))).await;
    assert_eq!(failed, SessionEvent::JoinFailed(JoinFailure::Rejected(RejectReason::RoomFull)));

    host.leave_room().await.unwrap();
}

/// A joiner leaving is removed from everyone's roster.
#[tokio::test]
async fn joiner_leave_updates_roster() {
    let registry = LocalDiscovery::new();
    let host = spawn("alice", Arc::new(registry.peer()));
    let joiner = spawn("bob", Arc::new(registry.peer()));
    let mut joiner_events = joiner.events();

    let room = host_room(&host, &registry, None).await;
    joiner.join_room(room, None).await.unwrap();
    expect_event(&mut joiner_events, |e| matches!(e, SessionEvent::Joined { .. })).await;

    let mut host_view = host.snapshot();
    tokio::time::timeout(Duration::from_secs(5), host_view.wait_for(|s| s.peers.len() == 2))
        .await
        .expect("joiner never listed")
        .expect("session stopped");

    joiner.leave_room().await.unwrap();
    expect_event(&mut joiner_events, |e| matches!(e, SessionEvent::Left)).await;

    tokio::time::timeout(Duration::from_secs(5), host_view.wait_for(|s| s.peers.len() == 1))
        .await
        .expect("joiner never removed")
        .expect("session stopped");

    host.leave_room().await.unwrap();
}
