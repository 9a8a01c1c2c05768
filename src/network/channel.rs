//! Reliable Channel
//!
//! One datagram socket talking to one fixed remote address. Offers
//! fire-and-forget sends and reliable sends that are retransmitted until
//! the remote echoes their sequence number or the retry budget runs out.
//!
//! The channel is driven by a single owner loop that interleaves
//! [`ReliableChannel::poll_receive`] and [`ReliableChannel::tick_retransmit`];
//! nothing else touches its state, so it needs no locks.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::ChannelConfig;
use crate::core::clock::Clock;
use super::packet::{self, Packet, PacketError, PacketType, MAX_DATAGRAM_LEN, UNRELIABLE_SEQ};
use super::reliability::{Delivery, ReliabilityTracker};
use super::transport::{DatagramSocket, SocketBinder};

/// A packet received on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Decoded packet.
    pub packet: Packet,
    /// Source address.
    pub from: SocketAddr,
    /// Reliable packet already delivered once (its ack got lost).
    pub duplicate: bool,
}

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Socket error.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    /// Packet could not be encoded.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Packet is larger than one UDP datagram.
    #[error("packet of {0} bytes exceeds the {max} byte datagram limit", max = MAX_DATAGRAM_LEN)]
    Oversized(usize),

    /// Channel already closed.
    #[error("channel closed")]
    Closed,
}

/// Reliable channel to one remote address.
pub struct ReliableChannel {
    socket: Option<Box<dyn DatagramSocket>>,
    remote: SocketAddr,
    tracker: ReliabilityTracker,
    clock: Arc<dyn Clock>,
    recv_timeout: Duration,
    recv_buffer: Vec<u8>,
}

impl ReliableChannel {
    /// Bind a socket at `local` and open a channel to `remote`.
    pub async fn open(
        binder: &dyn SocketBinder,
        local: SocketAddr,
        remote: SocketAddr,
        config: &ChannelConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ChannelError> {
        let socket = binder.bind(local).await?;
        Ok(Self::from_socket(socket, remote, config, clock))
    }

    /// Open a channel over an already bound socket.
    pub fn from_socket(
        socket: Box<dyn DatagramSocket>,
        remote: SocketAddr,
        config: &ChannelConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            socket: Some(socket),
            remote,
            tracker: ReliabilityTracker::new(config),
            clock,
            recv_timeout: config.recv_timeout,
            recv_buffer: vec![0u8; config.recv_buffer_size],
        }
    }

    /// Remote address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        Ok(self.socket()?.local_addr()?)
    }

    /// Last sequence number received from the remote.
    pub fn last_remote_seq(&self) -> u16 {
        self.tracker.remote_seq()
    }

    /// Reliable packets still waiting for an ack.
    pub fn pending_count(&self) -> usize {
        self.tracker.pending_count()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    fn socket(&self) -> Result<&dyn DatagramSocket, ChannelError> {
        self.socket.as_deref().ok_or(ChannelError::Closed)
    }

    /// Send once with seq 0; no retransmission.
    pub async fn send_unreliable(&mut self, kind: PacketType, payload: &[u8]) -> Result<(), ChannelError> {
        let bytes = self.frame(kind, UNRELIABLE_SEQ, payload)?;
        self.transmit(&bytes).await
    }

    /// Send with the next sequence number and keep it until acknowledged.
    ///
    /// The packet is queued before the first transmission, so a failed send
    /// is still retried by [`tick_retransmit`](Self::tick_retransmit).
    /// Packets that cannot fit a datagram are rejected before a sequence
    /// number is spent on them.
    pub async fn send_reliable(&mut self, kind: PacketType, payload: &[u8]) -> Result<u16, ChannelError> {
        self.socket()?;
        let seq = self.tracker.next_seq();
        let bytes = self.frame(kind, seq, payload)?;
        self.tracker.allocate_seq();
        self.tracker.track(seq, bytes.clone(), self.clock.now());
        self.transmit(&bytes).await?;
        Ok(seq)
    }

    /// Wait up to the receive timeout for one packet.
    ///
    /// Returns `Ok(None)` on timeout and for datagrams that fail to decode.
    pub async fn poll_receive(&mut self) -> Result<Option<Inbound>, ChannelError> {
        let socket = self.socket.as_deref().ok_or(ChannelError::Closed)?;
        let received = tokio::time::timeout(self.recv_timeout, socket.recv_from(&mut self.recv_buffer)).await;

        let (len, from) = match received {
            Err(_) => return Ok(None),
            Ok(result) => result?,
        };

        let packet = match packet::decode(&self.recv_buffer[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(%from, error = %e, "Dropping malformed datagram");
                return Ok(None);
            }
        };

        #[cfg(feature = "debug-tracing")]
        trace!(%from, kind = ?packet.kind, seq = packet.seq, ack = packet.ack, "recv");

        let delivery = self.tracker.observe(&packet);
        Ok(Some(Inbound {
            packet,
            from,
            duplicate: delivery == Delivery::Duplicate,
        }))
    }

    /// Resend pending packets whose retransmit timeout elapsed.
    ///
    /// Returns the number of datagrams resent. Packets out of retries are
    /// dropped silently. A failed resend is logged and does not hold back
    /// the others; the packet stays queued for its next attempt.
    pub async fn tick_retransmit(&mut self) -> Result<usize, ChannelError> {
        self.socket()?;
        let due = self.tracker.collect_due(self.clock.now());
        let mut resent = 0;
        for bytes in &due {
            match self.transmit(bytes).await {
                Ok(()) => resent += 1,
                Err(e) => warn!(remote = %self.remote, len = bytes.len(), error = %e, "Retransmit failed"),
            }
        }
        if resent > 0 {
            debug!(remote = %self.remote, resent, "Retransmitted");
        }
        Ok(resent)
    }

    /// The remote echoed `seq`: stop retransmitting it.
    pub fn on_ack_observed(&mut self, seq: u16) -> bool {
        self.tracker.on_ack_observed(seq)
    }

    /// Release the socket. Calling again is a no-op.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        self.tracker.clear();
        match self.socket.take() {
            Some(mut socket) => Ok(socket.close()?),
            None => Ok(()),
        }
    }

    fn frame(&self, kind: PacketType, seq: u16, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let packet = Packet::new(kind, seq, self.tracker.remote_seq(), payload.to_vec());
        if !packet.fits_datagram() {
            return Err(ChannelError::Oversized(packet.wire_len()));
        }
        Ok(packet.encode()?)
    }

    async fn transmit(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        #[cfg(feature = "debug-tracing")]
        trace!(remote = %self.remote, len = bytes.len(), "send");

        self.socket()?.send_to(bytes, self.remote).await?;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
