//! Room Host Endpoint
//!
//! The group owner's side of a room. A single task owns the room socket and
//! one reliability tracker per member. It admits or rejects handshakes,
//! assigns player ids, keeps the authoritative roster and relays broadcasts.
//!
//! The hosting player is member 0 like any other: its session channel sends
//! to this endpoint and receives relayed packets from it.
//!
//! Joiners that stay silent for longer than the peer timeout are dropped
//! from the roster as if they had sent DISCONNECT.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::{ChannelConfig, SessionConfig};
use crate::core::clock::Clock;
use crate::core::hash::{password_digest, verify_handshake};
use super::packet::{self, Packet, PacketType, UNRELIABLE_SEQ};
use super::protocol::{ChatMessage, PeerUpdate, RejectReason, WelcomeMessage, PING_LEN};
use super::reliability::{Delivery, ReliabilityTracker};
use super::room::{Peer, PlayerId, Room};
use super::transport::DatagramSocket;

/// One admitted member.
struct Member {
    peer: Peer,
    addr: SocketAddr,
    tracker: ReliabilityTracker,
    last_heard: Instant,
}

/// Room endpoint state, run as a task by [`RoomHost::spawn`].
pub struct RoomHost {
    socket: Box<dyn DatagramSocket>,
    room: Room,
    password_digest: Option<String>,
    members: BTreeMap<PlayerId, Member>,
    by_addr: HashMap<SocketAddr, PlayerId>,
    config: ChannelConfig,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    peer_timeout: Duration,
    recv_buffer: Vec<u8>,
}

impl RoomHost {
    /// Create the endpoint with the hosting player registered as member 0.
    ///
    /// `host_channel` is the local address of the host's own session channel.
    /// Channel timings, the tick and the peer timeout come from `config`.
    pub fn new(
        socket: Box<dyn DatagramSocket>,
        room: Room,
        password: Option<&str>,
        host_peer: Peer,
        host_channel: SocketAddr,
        config: &SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut host = Self {
            socket,
            room,
            password_digest: password.map(password_digest),
            members: BTreeMap::new(),
            by_addr: HashMap::new(),
            recv_buffer: vec![0u8; config.channel.recv_buffer_size],
            config: config.channel.clone(),
            clock,
            tick_interval: config.tick_interval,
            peer_timeout: config.peer_timeout,
        };
        host.insert_member(host_peer, host_channel);
        host
    }

    /// Current roster, ordered by player id.
    pub fn roster(&self) -> Vec<Peer> {
        self.members.values().map(|m| m.peer.clone()).collect()
    }

    /// Run on a new task.
    pub fn spawn(self) -> RoomHostHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        RoomHostHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// Serve until `shutdown` fires or its sender is dropped.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        info!(room = %self.room.name, addr = %self.room.addr(), "Room host started");

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                received = self.socket.recv_from(&mut self.recv_buffer) => match received {
                    Ok((len, from)) => {
                        let data = self.recv_buffer[..len].to_vec();
                        self.handle_datagram(&data, from).await;
                    }
                    Err(e) => debug!(error = %e, "Room socket receive error"),
                },
                _ = ticker.tick() => {
                    self.expire_silent().await;
                    self.retransmit().await;
                }
            }
        }

        self.close_room().await;
    }

    /// Process one datagram from `from`.
    pub async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let packet = match packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(%from, error = %e, "Dropping malformed datagram");
                return;
            }
        };

        let Some(&id) = self.by_addr.get(&from) else {
            if packet.kind == PacketType::Handshake {
                self.admit(&packet, from).await;
            } else {
                trace!(%from, kind = ?packet.kind, "Ignoring packet from unknown sender");
            }
            return;
        };

        let now = self.clock.now();
        let delivery = match self.members.get_mut(&id) {
            Some(member) => {
                member.last_heard = now;
                member.tracker.observe(&packet)
            }
            None => return,
        };
        if packet.is_reliable() {
            self.send_ack(id).await;
        }
        if delivery == Delivery::Duplicate {
            return;
        }

        match packet.kind {
            // A resent handshake reuses its seq and is dropped above as a
            // duplicate; a lost WELCOME is recovered by its own retransmission
            PacketType::Handshake | PacketType::Welcome => {}
            PacketType::Heartbeat => {
                if packet.payload.len() == PING_LEN {
                    self.send(id, PacketType::Heartbeat, &packet.payload, false).await;
                }
            }
            PacketType::Chat => self.relay_chat(id, &packet.payload).await,
            PacketType::Spawn => {
                if id.is_host() {
                    info!(level = %String::from_utf8_lossy(&packet.payload), "Starting game");
                    self.broadcast(None, PacketType::Spawn, &packet.payload, true).await;
                } else {
                    warn!(player = %id, "SPAWN from non-host ignored");
                }
            }
            PacketType::State => self.apply_update(id, &packet.payload).await,
            PacketType::Disconnect => {
                // The host leaving is handled by shutdown
                if !id.is_host() {
                    self.remove_member(id);
                    self.broadcast_welcome().await;
                }
            }
            PacketType::Input | PacketType::Damage | PacketType::Item | PacketType::Migrate => {
                self.broadcast(Some(id), packet.kind, &packet.payload, packet.is_reliable()).await;
            }
        }
    }

    async fn admit(&mut self, packet: &Packet, from: SocketAddr) {
        let reason = if self
            .password_digest
            .as_deref()
            .map(|expected| !verify_handshake(&packet.payload, expected))
            .unwrap_or(false)
        {
            Some(RejectReason::BadPassword)
        } else if self.members.len() >= usize::from(self.room.max_players) {
            Some(RejectReason::RoomFull)
        } else {
            None
        };

        if let Some(reason) = reason {
            info!(%from, %reason, "Rejecting join");
            // Ack the handshake so the joiner stops retransmitting it
            match packet::encode(PacketType::Disconnect, UNRELIABLE_SEQ, packet.seq, &reason.to_payload()) {
                Ok(bytes) => {
                    if let Err(e) = self.socket.send_to(&bytes, from).await {
                        warn!(%from, error = %e, "Failed to send rejection");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode rejection"),
            }
            return;
        }

        let Some(id) = (1..=u8::MAX).map(PlayerId).find(|id| !self.members.contains_key(id)) else {
            return;
        };
        let peer = Peer::joiner(id, format!("Player {}", id.0));
        self.insert_member(peer, from);
        if let Some(member) = self.members.get_mut(&id) {
            member.tracker.observe(packet);
        }

        info!(player = %id, %from, members = self.members.len(), "Player joined");
        self.send_ack(id).await;
        self.broadcast_welcome().await;
    }

    fn insert_member(&mut self, peer: Peer, addr: SocketAddr) {
        let id = peer.player_id;
        self.by_addr.insert(addr, id);
        self.members.insert(id, Member {
            peer,
            addr,
            tracker: ReliabilityTracker::new(&self.config),
            last_heard: self.clock.now(),
        });
    }

    /// Drop joiners not heard from within the peer timeout.
    ///
    /// Returns the removed ids. The host's own member is never expired.
    pub async fn expire_silent(&mut self) -> Vec<PlayerId> {
        let now = self.clock.now();
        let timeout = self.peer_timeout;
        let silent: Vec<PlayerId> = self
            .members
            .iter()
            .filter(|(id, m)| !id.is_host() && now.saturating_duration_since(m.last_heard) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &silent {
            warn!(player = %id, timeout_ms = timeout.as_millis() as u64, "Member timed out");
            self.remove_member(*id);
        }
        if !silent.is_empty() {
            self.broadcast_welcome().await;
        }
        silent
    }

    fn remove_member(&mut self, id: PlayerId) {
        if let Some(member) = self.members.remove(&id) {
            self.by_addr.remove(&member.addr);
            info!(player = %id, nickname = %member.peer.nickname, "Player left");
        }
    }

    async fn apply_update(&mut self, id: PlayerId, payload: &[u8]) {
        let update = match PeerUpdate::from_payload(payload) {
            Ok(update) => update,
            Err(e) => {
                debug!(player = %id, error = %e, "Bad STATE payload");
                return;
            }
        };
        if let Some(member) = self.members.get_mut(&id) {
            member.peer.ready = update.ready;
            if let Some(nickname) = update.nickname {
                member.peer.nickname = nickname;
            }
        }
        self.broadcast_welcome().await;
    }

    async fn relay_chat(&mut self, id: PlayerId, payload: &[u8]) {
        let Some(nickname) = self.members.get(&id).map(|m| m.peer.nickname.clone()) else {
            return;
        };
        let text = match ChatMessage::from_payload(payload) {
            Ok(chat) => chat.text,
            Err(e) => {
                debug!(player = %id, error = %e, "Bad CHAT payload");
                return;
            }
        };
        let stamped = ChatMessage { from: id, nickname, text };
        match stamped.to_payload() {
            Ok(bytes) => self.broadcast(None, PacketType::Chat, &bytes, true).await,
            Err(e) => warn!(error = %e, "Failed to encode chat"),
        }
    }

    async fn send_welcome(&mut self, id: PlayerId) {
        let welcome = WelcomeMessage {
            player_id: id,
            roster: self.roster(),
        };
        match welcome.to_payload() {
            Ok(bytes) => self.send(id, PacketType::Welcome, &bytes, true).await,
            Err(e) => warn!(error = %e, "Failed to encode welcome"),
        }
    }

    /// Send every member its own WELCOME with the current roster.
    async fn broadcast_welcome(&mut self) {
        let ids: Vec<PlayerId> = self.members.keys().copied().collect();
        for id in ids {
            self.send_welcome(id).await;
        }
    }

    async fn broadcast(&mut self, except: Option<PlayerId>, kind: PacketType, payload: &[u8], reliable: bool) {
        let ids: Vec<PlayerId> = self.members.keys().copied().filter(|id| Some(*id) != except).collect();
        for id in ids {
            self.send(id, kind, payload, reliable).await;
        }
    }

    async fn send_ack(&mut self, id: PlayerId) {
        self.send(id, PacketType::Heartbeat, &[], false).await;
    }

    async fn send(&mut self, id: PlayerId, kind: PacketType, payload: &[u8], reliable: bool) {
        let now = self.clock.now();
        let Some(member) = self.members.get_mut(&id) else {
            return;
        };

        let seq = if reliable { member.tracker.next_seq() } else { UNRELIABLE_SEQ };
        let packet = Packet::new(kind, seq, member.tracker.remote_seq(), payload.to_vec());
        if !packet.fits_datagram() {
            warn!(player = %id, kind = ?kind, len = packet.wire_len(), "Packet exceeds datagram limit, dropped");
            return;
        }
        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(player = %id, error = %e, "Failed to encode packet");
                return;
            }
        };
        if reliable {
            member.tracker.allocate_seq();
            member.tracker.track(seq, bytes.clone(), now);
        }

        let addr = member.addr;
        if let Err(e) = self.socket.send_to(&bytes, addr).await {
            warn!(player = %id, %addr, error = %e, "Send failed");
        }
    }

    async fn retransmit(&mut self) {
        let now = self.clock.now();
        let mut due = Vec::new();
        for member in self.members.values_mut() {
            for bytes in member.tracker.collect_due(now) {
                due.push((member.addr, bytes));
            }
        }
        for (addr, bytes) in due {
            if let Err(e) = self.socket.send_to(&bytes, addr).await {
                warn!(%addr, error = %e, "Retransmit failed");
            }
        }
    }

    async fn close_room(&mut self) {
        let reason = RejectReason::RoomClosed.to_payload();
        let ids: Vec<PlayerId> = self.members.keys().copied().filter(|id| !id.is_host()).collect();
        for id in ids {
            self.send(id, PacketType::Disconnect, &reason, false).await;
        }
        if let Err(e) = self.socket.close() {
            warn!(error = %e, "Error closing room socket");
        }
        info!(room = %self.room.name, "Room host stopped");
    }
}

/// Control handle for a running [`RoomHost`].
pub struct RoomHostHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RoomHostHandle {
    /// Signal the task and wait up to `grace` for it to finish, then abort.
    pub async fn shutdown(mut self, grace: Duration) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            warn!("Room host did not stop in time, aborting");
            self.task.abort();
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
