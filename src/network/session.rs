//! Session Lifecycle
//!
//! [`SessionController`] owns the room state machine:
//!
//! ```text
//!          create_room                 leave_room / RoomClosed
//!   Idle ───────────────► Hosting ─────────────────────────────► Idle
//!     │
//!     │ join_room          WELCOME              RoomClosed / ConnectionLost
//!     └──────────► Joining ───────► Connected ──────────────────────────► Idle
//!                     │
//!                     └── DISCONNECT / timeout ──► Idle (JoinFailed)
//! ```
//!
//! A connected joiner that hears nothing from the host for the peer timeout
//! gives up on the room with [`SessionEvent::ConnectionLost`].
//!
//! The controller is driven by one owner: either [`SessionController::tick`]
//! in a loop, or the [`SessionService`](super::service::SessionService) actor.
//! Observers get events on a broadcast channel and the latest
//! [`SessionSnapshot`] on a watch channel.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::SessionConfig;
use crate::core::clock::{Clock, SystemClock};
use crate::core::hash::handshake_payload;
use super::channel::{ChannelError, Inbound, ReliableChannel};
use super::discovery::{DiscoveryAdapter, DiscoveryError};
use super::host::{RoomHost, RoomHostHandle};
use super::packet::{Packet, PacketType};
use super::protocol::{
    decode_level, decode_ping, encode_ping, ChatMessage, PeerUpdate, RejectReason, WelcomeMessage,
};
use super::room::{GameMode, Peer, PlayerId, Room};
use super::transport::{SocketBinder, UdpBinder};

/// How long `leave_room` waits for the room host task before aborting it.
pub const HOST_SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

const EVENT_CAPACITY: usize = 64;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not in a room.
    Idle,
    /// Hosting a room.
    Hosting,
    /// Handshake sent, waiting for WELCOME.
    Joining,
    /// Member of someone else's room.
    Connected,
}

impl SessionState {
    /// Hosting or connected.
    pub fn in_room(self) -> bool {
        matches!(self, SessionState::Hosting | SessionState::Connected)
    }
}

/// Why a join did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinFailure {
    /// The host answered with DISCONNECT.
    Rejected(RejectReason),
    /// No WELCOME within the handshake timeout.
    Timeout,
}

/// Notifications for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// This device now hosts a room.
    RoomCreated(Room),
    /// Room is hosted but cannot be advertised.
    DiscoveryUnsupported,
    /// Advertising failed.
    DiscoveryFailed(String),
    /// WELCOME received.
    Joined {
        /// Id assigned by the host.
        player_id: PlayerId,
    },
    /// Join attempt ended without WELCOME.
    JoinFailed(JoinFailure),
    /// Roster replaced.
    RosterChanged(Vec<Peer>),
    /// Chat line relayed by the host.
    Chat(ChatMessage),
    /// Host started the game.
    GameStarting {
        /// Level to load.
        level: String,
    },
    /// Host closed the room.
    RoomClosed,
    /// Host stopped answering.
    ConnectionLost,
    /// `leave_room` finished.
    Left,
}

/// Read-only view of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Current state.
    pub state: SessionState,
    /// Room, while in one.
    pub room: Option<Room>,
    /// Roster, ordered by player id.
    pub peers: Vec<Peer>,
    /// Whether this device hosts.
    pub is_host: bool,
    /// Own player id once assigned.
    pub local_player: Option<PlayerId>,
}

impl SessionSnapshot {
    fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            room: None,
            peers: Vec::new(),
            is_host: false,
            local_player: None,
        }
    }

    /// Every joiner has flagged ready. The host's own flag is not required.
    pub fn all_ready(&self) -> bool {
        self.peers.iter().filter(|p| !p.is_host).all(|p| p.ready)
    }

    /// Own roster entry.
    pub fn local_peer(&self) -> Option<&Peer> {
        let id = self.local_player?;
        self.peers.iter().find(|p| p.player_id == id)
    }
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Operation requires an idle session.
    #[error("session busy: {0:?}")]
    NotIdle(SessionState),

    /// Operation requires being in a room.
    #[error("not in a room")]
    NotInRoom,

    /// Channel failure.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Socket setup failure.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    /// Payload could not be serialized.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// The session service task is gone.
    #[error("session service stopped")]
    ServiceStopped,
}

/// Collaborators injected into a controller.
#[derive(Clone)]
pub struct SessionContext {
    /// Settings.
    pub config: SessionConfig,
    /// Room advertisement.
    pub discovery: Arc<dyn DiscoveryAdapter>,
    /// Socket factory.
    pub binder: Arc<dyn SocketBinder>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl SessionContext {
    /// Context with UDP sockets and the system clock.
    pub fn new(config: SessionConfig, discovery: Arc<dyn DiscoveryAdapter>) -> Self {
        Self {
            config,
            discovery,
            binder: Arc::new(UdpBinder),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the socket factory.
    pub fn with_binder(mut self, binder: Arc<dyn SocketBinder>) -> Self {
        self.binder = binder;
        self
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Room lifecycle state machine.
pub struct SessionController {
    ctx: SessionContext,
    state: SessionState,
    room: Option<Room>,
    roster: BTreeMap<PlayerId, Peer>,
    is_host: bool,
    local_player: Option<PlayerId>,
    channel: Option<ReliableChannel>,
    host: Option<RoomHostHandle>,
    /// When the HANDSHAKE went out.
    join_started: Option<Instant>,
    last_ping: Option<Instant>,
    /// When the last packet arrived on the channel.
    last_heard: Option<Instant>,
    /// Origin of ping timestamps.
    epoch: Instant,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl SessionController {
    /// Create an idle controller.
    pub fn new(ctx: SessionContext) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot, _) = watch::channel(SessionSnapshot::idle());
        let epoch = ctx.clock.now();
        Self {
            ctx,
            state: SessionState::Idle,
            room: None,
            roster: BTreeMap::new(),
            is_host: false,
            local_player: None,
            channel: None,
            host: None,
            join_started: None,
            last_ping: None,
            last_heard: None,
            epoch,
            events,
            snapshot,
        }
    }

    /// Settings.
    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether this device hosts the current room.
    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Current room.
    pub fn room(&self) -> Option<&Room> {
        self.room.as_ref()
    }

    /// Roster, ordered by player id.
    pub fn roster(&self) -> Vec<Peer> {
        self.roster.values().cloned().collect()
    }

    /// Whether a channel is open.
    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    /// Current view of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            room: self.room.clone(),
            peers: self.roster(),
            is_host: self.is_host,
            local_player: self.local_player,
        }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Watch snapshots.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<SessionEvent> {
        self.events.clone()
    }

    // =========================================================================
    // OPERATIONS
    // =========================================================================

    /// Host a new room.
    ///
    /// Binds the room socket first so the advertised port is the real one.
    /// A device that cannot advertise still hosts; observers get
    /// [`SessionEvent::DiscoveryUnsupported`].
    #[instrument(skip(self, password))]
    pub async fn create_room(
        &mut self,
        name: &str,
        password: Option<&str>,
        mode: GameMode,
    ) -> Result<Room, SessionError> {
        self.ensure_idle()?;
        let config = &self.ctx.config;
        let password = password.filter(|p| !p.is_empty());

        let listener = self.ctx.binder.bind(SocketAddr::new(config.bind_ip, config.port)).await?;
        let port = listener.local_addr()?.port();
        let room = Room::new(name, mode, password.is_some(), config.host_ip, port, config.max_players);

        let channel = ReliableChannel::open(
            self.ctx.binder.as_ref(),
            SocketAddr::new(config.host_ip, 0),
            room.addr(),
            &config.channel,
            Arc::clone(&self.ctx.clock),
        )
        .await?;

        let host_peer = Peer::host(config.nickname.clone());
        let host = RoomHost::new(
            listener,
            room.clone(),
            password,
            host_peer.clone(),
            channel.local_addr()?,
            config,
            Arc::clone(&self.ctx.clock),
        );

        self.host = Some(host.spawn());
        self.channel = Some(channel);
        self.state = SessionState::Hosting;
        self.is_host = true;
        self.local_player = Some(PlayerId::HOST);
        self.roster.insert(PlayerId::HOST, host_peer);
        self.room = Some(room.clone());
        self.last_ping = Some(self.ctx.clock.now());

        info!(room = %room.name, addr = %room.addr(), has_password = room.has_password, "Room created");
        self.emit(SessionEvent::RoomCreated(room.clone()));

        match self.ctx.discovery.advertise(&room) {
            Ok(()) => {}
            Err(DiscoveryError::Unsupported) => {
                warn!("Discovery unsupported, room is not advertised");
                self.emit(SessionEvent::DiscoveryUnsupported);
            }
            Err(e) => {
                warn!(error = %e, "Failed to advertise room");
                self.emit(SessionEvent::DiscoveryFailed(e.to_string()));
            }
        }

        self.publish();
        Ok(room)
    }

    /// Start joining a room.
    ///
    /// Returns once the HANDSHAKE is sent; the outcome arrives as
    /// [`SessionEvent::Joined`] or [`SessionEvent::JoinFailed`].
    #[instrument(skip(self, room, password), fields(room = %room.name, addr = %room.addr()))]
    pub async fn join_room(&mut self, room: &Room, password: Option<&str>) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let config = &self.ctx.config;

        let channel = ReliableChannel::open(
            self.ctx.binder.as_ref(),
            SocketAddr::new(config.bind_ip, 0),
            room.addr(),
            &config.channel,
            Arc::clone(&self.ctx.clock),
        )
        .await?;

        self.channel = Some(channel);
        self.state = SessionState::Joining;
        self.room = Some(room.clone());
        self.is_host = false;
        self.join_started = Some(self.ctx.clock.now());

        let payload = handshake_payload(password.unwrap_or(""));
        if let Err(e) = self.send_reliable(PacketType::Handshake, &payload).await {
            self.teardown().await;
            return Err(e);
        }

        info!("Handshake sent");
        self.publish();
        Ok(())
    }

    /// Leave the current room.
    ///
    /// Always ends Idle; socket errors on the way out are only logged.
    pub async fn leave_room(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        if let Some(channel) = self.channel.as_mut() {
            if let Err(e) = channel.send_reliable(PacketType::Disconnect, &[]).await {
                debug!(error = %e, "DISCONNECT not sent");
            }
        }
        self.teardown().await;
        info!("Left room");
        self.emit(SessionEvent::Left);
    }

    /// Tell every member to load the level. Ignored unless hosting.
    pub async fn start_game(&mut self) -> Result<(), SessionError> {
        if !self.is_host || self.state != SessionState::Hosting {
            debug!(state = ?self.state, "start_game ignored: not hosting");
            return Ok(());
        }
        let level = self.ctx.config.level_id.clone();
        info!(%level, players = self.roster.len(), "Starting game");
        self.send_reliable(PacketType::Spawn, level.as_bytes()).await?;
        Ok(())
    }

    /// Set the local ready flag.
    pub async fn set_ready(&mut self, ready: bool) -> Result<(), SessionError> {
        self.ensure_in_room()?;
        let update = PeerUpdate { ready, nickname: None };
        self.send_reliable(PacketType::State, &update.to_payload()?).await?;
        Ok(())
    }

    /// Send a chat line to the room.
    pub async fn send_chat(&mut self, text: &str) -> Result<(), SessionError> {
        self.ensure_in_room()?;
        let chat = ChatMessage {
            from: self.local_player.unwrap_or(PlayerId::HOST),
            nickname: self.ctx.config.nickname.clone(),
            text: text.to_string(),
        };
        self.send_reliable(PacketType::Chat, &chat.to_payload()?).await?;
        Ok(())
    }

    // =========================================================================
    // DRIVING
    // =========================================================================

    /// One pass of the session loop: receive, dispatch, run timers.
    pub async fn tick(&mut self) -> Result<(), SessionError> {
        if let Some(inbound) = self.poll_channel().await? {
            self.handle_inbound(inbound).await?;
        }
        self.tick_timers().await
    }

    /// Wait for one packet on the open channel.
    ///
    /// Cancel-safe: nothing is mutated until a datagram has been received.
    pub async fn poll_channel(&mut self) -> Result<Option<Inbound>, SessionError> {
        match self.channel.as_mut() {
            Some(channel) => Ok(channel.poll_receive().await?),
            None => Ok(None),
        }
    }

    /// Acknowledge and dispatch a received packet.
    pub async fn handle_inbound(&mut self, inbound: Inbound) -> Result<(), SessionError> {
        let Inbound { packet, duplicate, .. } = inbound;
        self.last_heard = Some(self.ctx.clock.now());

        if packet.is_reliable() {
            if let Some(channel) = self.channel.as_mut() {
                if let Err(e) = channel.send_unreliable(PacketType::Heartbeat, &[]).await {
                    debug!(error = %e, seq = packet.seq, "Ack not sent");
                }
            }
        }
        if duplicate {
            trace!(kind = ?packet.kind, seq = packet.seq, "Duplicate suppressed");
            return Ok(());
        }

        self.dispatch(packet).await
    }

    /// Retransmission, handshake timeout, heartbeat and host liveness.
    pub async fn tick_timers(&mut self) -> Result<(), SessionError> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(());
        };
        if let Err(e) = channel.tick_retransmit().await {
            debug!(error = %e, "Retransmit failed");
        }

        let now = self.ctx.clock.now();
        match self.state {
            SessionState::Joining => {
                let expired = self
                    .join_started
                    .map(|t| now.saturating_duration_since(t) >= self.ctx.config.handshake_timeout)
                    .unwrap_or(false);
                if expired {
                    warn!("No WELCOME before the handshake timeout");
                    self.teardown().await;
                    self.emit(SessionEvent::JoinFailed(JoinFailure::Timeout));
                }
            }
            SessionState::Hosting | SessionState::Connected => {
                if self.state == SessionState::Connected && self.host_silent(now) {
                    warn!(
                        timeout_ms = self.ctx.config.peer_timeout.as_millis() as u64,
                        "Host stopped responding"
                    );
                    self.teardown().await;
                    self.emit(SessionEvent::ConnectionLost);
                    return Ok(());
                }
                let due = self
                    .last_ping
                    .map(|t| now.saturating_duration_since(t) >= self.ctx.config.heartbeat_interval)
                    .unwrap_or(true);
                if due {
                    self.last_ping = Some(now);
                    let ping = encode_ping(self.elapsed_ms());
                    if let Some(channel) = self.channel.as_mut() {
                        channel.send_unreliable(PacketType::Heartbeat, &ping).await?;
                    }
                }
            }
            SessionState::Idle => {}
        }
        Ok(())
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    async fn dispatch(&mut self, packet: Packet) -> Result<(), SessionError> {
        match packet.kind {
            PacketType::Welcome => self.on_welcome(&packet.payload).await?,
            PacketType::Chat => match ChatMessage::from_payload(&packet.payload) {
                Ok(chat) => self.emit(SessionEvent::Chat(chat)),
                Err(e) => debug!(error = %e, "Bad CHAT payload"),
            },
            PacketType::Spawn => {
                let level = decode_level(&packet.payload);
                info!(%level, "Game starting");
                self.emit(SessionEvent::GameStarting { level });
            }
            PacketType::Disconnect => self.on_disconnect(&packet.payload).await,
            PacketType::Heartbeat => self.on_heartbeat(&packet.payload),
            PacketType::Handshake
            | PacketType::Input
            | PacketType::State
            | PacketType::Damage
            | PacketType::Item
            | PacketType::Migrate => {}
        }
        Ok(())
    }

    async fn on_welcome(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let welcome = match WelcomeMessage::from_payload(payload) {
            Ok(welcome) => welcome,
            Err(e) => {
                debug!(error = %e, "Bad WELCOME payload");
                return Ok(());
            }
        };
        if self.state == SessionState::Idle {
            return Ok(());
        }

        let player_id = welcome.player_id;
        let own_rtt = self.local_player.and_then(|id| self.roster.get(&id)).map(|p| p.rtt_ms);
        self.local_player = Some(player_id);
        self.roster = welcome.roster.into_iter().map(|p| (p.player_id, p)).collect();
        if let (Some(rtt), Some(me)) = (own_rtt, self.roster.get_mut(&player_id)) {
            me.rtt_ms = rtt;
        }

        let players = u8::try_from(self.roster.len()).unwrap_or(u8::MAX);
        let updated = self
            .room
            .as_ref()
            .filter(|room| room.players != players)
            .map(|room| room.with_player_count(players));
        if let Some(room) = updated {
            if self.is_host {
                if let Err(e) = self.ctx.discovery.advertise(&room) {
                    debug!(error = %e, "Re-advertise failed");
                }
            }
            self.room = Some(room);
        }

        let joined = self.state == SessionState::Joining;
        if joined {
            self.state = SessionState::Connected;
            self.join_started = None;
            self.last_ping = Some(self.ctx.clock.now());
            self.last_heard = self.last_ping;
            info!(player = %player_id, "Joined room");
            self.emit(SessionEvent::Joined { player_id });
        }

        debug!(players = self.roster.len(), "Roster updated");
        self.emit(SessionEvent::RosterChanged(self.roster()));
        self.publish();

        if joined {
            let update = PeerUpdate {
                ready: false,
                nickname: Some(self.ctx.config.nickname.clone()),
            };
            self.send_reliable(PacketType::State, &update.to_payload()?).await?;
        }
        Ok(())
    }

    async fn on_disconnect(&mut self, payload: &[u8]) {
        match self.state {
            SessionState::Joining => {
                let reason = RejectReason::from_payload(payload)
                    .unwrap_or_else(|| RejectReason::Other("unknown".to_string()));
                warn!(%reason, "Join rejected");
                self.teardown().await;
                self.emit(SessionEvent::JoinFailed(JoinFailure::Rejected(reason)));
            }
            SessionState::Connected => {
                info!("Host closed the room");
                self.teardown().await;
                self.emit(SessionEvent::RoomClosed);
            }
            SessionState::Hosting | SessionState::Idle => {}
        }
    }

    fn on_heartbeat(&mut self, payload: &[u8]) {
        // Empty heartbeats only carry an ack
        let Some(sent) = decode_ping(payload) else {
            return;
        };
        let rtt = self.elapsed_ms().saturating_sub(sent);
        if let Some(me) = self.local_player.and_then(|id| self.roster.get_mut(&id)) {
            me.rtt_ms = u32::try_from(rtt).unwrap_or(u32::MAX);
            trace!(rtt_ms = me.rtt_ms, "Ping");
            self.publish();
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    async fn send_reliable(&mut self, kind: PacketType, payload: &[u8]) -> Result<u16, SessionError> {
        let channel = self.channel.as_mut().ok_or(SessionError::NotInRoom)?;
        Ok(channel.send_reliable(kind, payload).await?)
    }

    /// Release everything and return to Idle.
    async fn teardown(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close() {
                warn!(error = %e, "Error closing channel");
            }
        }
        if let Some(host) = self.host.take() {
            host.shutdown(HOST_SHUTDOWN_GRACE).await;
        }
        if self.is_host {
            self.ctx.discovery.withdraw();
        }

        self.state = SessionState::Idle;
        self.room = None;
        self.roster.clear();
        self.is_host = false;
        self.local_player = None;
        self.join_started = None;
        self.last_ping = None;
        self.last_heard = None;
        self.publish();
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle => Ok(()),
            other => Err(SessionError::NotIdle(other)),
        }
    }

    fn ensure_in_room(&self) -> Result<(), SessionError> {
        if self.state.in_room() {
            Ok(())
        } else {
            Err(SessionError::NotInRoom)
        }
    }

    fn host_silent(&self, now: Instant) -> bool {
        self.last_heard
            .map(|t| now.saturating_duration_since(t) >= self.ctx.config.peer_timeout)
            .unwrap_or(false)
    }

    fn elapsed_ms(&self) -> u64 {
        let elapsed = self.ctx.clock.now().saturating_duration_since(self.epoch);
        u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.snapshot());
    }
}

// =============================================================================
// TESTS
// =============================================================================
