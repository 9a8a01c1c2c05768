//! Lanplay Session Demo
//!
//! `lanplay` with no arguments runs a host and a joiner on loopback.
//! `lanplay host <name> [password]` hosts a room on the configured address.
//! `lanplay join <ip:port> [password]` joins a room directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lanplay::{
    DiscoveryAdapter, GameMode, LocalDiscovery, Room, SessionConfig, SessionContext,
    SessionController, SessionEvent, SessionHandle, SessionService, VERSION,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    info!("Lanplay v{}", VERSION);

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("demo") => demo().await,
        Some("host") => {
            let name = args.get(1).context("usage: lanplay host <name> [password]")?;
            host(name, args.get(2).map(String::as_str)).await
        }
        Some("join") => {
            let addr: SocketAddr = args
                .get(1)
                .context("usage: lanplay join <ip:port> [password]")?
                .parse()
                .context("invalid room address")?;
            join(addr, args.get(2).map(String::as_str)).await
        }
        Some(other) => bail!("unknown command {:?}", other),
    }
}

fn spawn_session(config: SessionConfig, discovery: Arc<dyn DiscoveryAdapter>) -> SessionHandle {
    SessionService::spawn(SessionController::new(SessionContext::new(config, discovery)))
}

/// Host a room until Ctrl-C.
async fn host(name: &str, password: Option<&str>) -> Result<()> {
    let session = spawn_session(SessionConfig::from_env(), Arc::new(LocalDiscovery::new()));
    let events = session.events();

    let room = session.create_room(name, password, GameMode::Coop).await?;
    info!("Hosting {:?} on {}", room.name, room.addr());

    tokio::select! {
        _ = log_events(events) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    session.leave_room().await?;
    Ok(())
}

/// Join a room by address until it closes or Ctrl-C.
async fn join(addr: SocketAddr, password: Option<&str>) -> Result<()> {
    let config = SessionConfig::from_env();
    let session = spawn_session(config.clone(), Arc::new(LocalDiscovery::new()));
    let events = session.events();

    let room = Room::new("remote", GameMode::Coop, password.is_some(), addr.ip(), addr.port(), config.max_players);
    session.join_room(room, password).await?;

    tokio::select! {
        _ = log_events(events) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    session.leave_room().await?;
    Ok(())
}

/// Log events until the session leaves its room.
async fn log_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                info!("{:?}", event);
                if matches!(
                    event,
                    SessionEvent::RoomClosed
                        | SessionEvent::ConnectionLost
                        | SessionEvent::Left
                        | SessionEvent::JoinFailed(_)
                ) {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} events", n),
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Demo: host and joiner on loopback through an in-process discovery registry.
async fn demo() -> Result<()> {
    info!("=== Starting Loopback Demo ===");

    let registry = LocalDiscovery::new();
    let mut rooms = registry.rooms();
    let host = spawn_session(SessionConfig::loopback("alice"), Arc::new(registry.peer()));
    let joiner = spawn_session(SessionConfig::loopback("bob"), Arc::new(registry));

    let mut host_events = host.events();
    let mut joiner_events = joiner.events();

    let room = host.create_room("Demo Room", Some("secret"), GameMode::Race).await?;
    info!("Room created at {}", room.addr());

    let discovered = tokio::time::timeout(Duration::from_secs(2), rooms.wait_for(|r| !r.is_empty()))
        .await
        .context("room never advertised")??
        .first()
        .cloned()
        .context("room list empty")?;
    info!("Discovered {:?} ({}/{} players)", discovered.name, discovered.players, discovered.max_players);

    joiner.join_room(discovered, Some("secret")).await?;
    match wait_for(&mut joiner_events, |e| matches!(e, SessionEvent::Joined { .. } | SessionEvent::JoinFailed(_))).await? {
        SessionEvent::Joined { player_id } => info!("Joined as {}", player_id),
        other => bail!("join failed: {:?}", other),
    }

    joiner.set_ready(true).await?;
    joiner.send_chat("hello from bob").await?;
    if let SessionEvent::Chat(chat) = wait_for(&mut host_events, |e| matches!(e, SessionEvent::Chat(_))).await? {
        info!("Host heard {}: {:?}", chat.nickname, chat.text);
    }

    let mut snapshot = host.snapshot();
    tokio::time::timeout(Duration::from_secs(2), snapshot.wait_for(|s| s.peers.len() == 2 && s.all_ready()))
        .await
        .context("joiner never ready")??;
    info!("Everyone ready, starting");

    host.start_game().await?;
    if let SessionEvent::GameStarting { level } = wait_for(&mut joiner_events, |e| matches!(e, SessionEvent::GameStarting { .. })).await? {
        info!("Joiner loading {}", level);
    }

    host.leave_room().await?;
    wait_for(&mut joiner_events, |e| matches!(e, SessionEvent::RoomClosed)).await?;
    info!("Joiner saw the room close");

    info!("=== Demo Complete ===");
    Ok(())
}

async fn wait_for(
    events: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> Result<SessionEvent> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => bail!("session stopped"),
            }
        }
    })
    .await
    .context("timed out waiting for session event")?
}
