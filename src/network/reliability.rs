//! Link Reliability Bookkeeping
//!
//! Socket-free state of one link: sequence allocation, the last sequence
//! number seen from the remote, the set of in-flight reliable packets and
//! their retransmission schedule.
//!
//! Acknowledgment is a single scalar. A pending packet is acknowledged only
//! when its exact sequence number comes back in the ack field of a later
//! packet; there is no cumulative or selective ack. Because matching is by
//! equality, sequence wraparound (65535 → 0) never requires ordering
//! comparisons.
//!
//! Sequence 0 doubles as the unreliable marker. After a sender wraps, its
//! reliable packet with seq 0 is indistinguishable from an unreliable one.
//! The receiver neither acks it nor records it for duplicate suppression,
//! so the sender keeps it pending until the retry budget runs out and the
//! receiver delivers it once per transmission: up to four times with the
//! default three retries. The protocol leaves this as is.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::ChannelConfig;
use super::packet::Packet;

/// Reliable sequence numbers remembered for duplicate suppression.
pub const DUPLICATE_WINDOW: usize = 64;

/// Next sequence number after `seq`, wrapping 65535 to 0.
#[inline]
pub fn next_sequence(seq: u16) -> u16 {
    seq.wrapping_add(1)
}

/// A reliable packet waiting for its ack.
#[derive(Debug, Clone)]
pub struct PendingSend {
    /// Sequence number.
    pub seq: u16,
    /// Encoded datagram, resent verbatim.
    pub bytes: Vec<u8>,
    /// When it was last put on the wire.
    pub last_sent: Instant,
    /// Retransmissions so far.
    pub retries: u32,
}

/// Outcome of observing a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Unreliable packet (seq 0).
    Unreliable,
    /// First delivery of a reliable packet.
    Fresh,
    /// Reliable packet seen before (its ack was lost).
    Duplicate,
}

/// Reliability state for one link.
#[derive(Debug)]
pub struct ReliabilityTracker {
    /// Last sequence number handed out.
    local_seq: u16,
    /// Sequence number of the last packet received from the remote.
    remote_seq: u16,
    /// In-flight reliable packets.
    pending: BTreeMap<u16, PendingSend>,
    /// Recently delivered reliable sequence numbers.
    recent: VecDeque<u16>,
    retransmit_timeout: Duration,
    max_retries: u32,
}

impl ReliabilityTracker {
    /// Create a tracker with the given channel timings.
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            local_seq: 0,
            remote_seq: 0,
            pending: BTreeMap::new(),
            recent: VecDeque::with_capacity(DUPLICATE_WINDOW),
            retransmit_timeout: config.retransmit_timeout,
            max_retries: config.max_retries,
        }
    }

    /// Sequence number the next [`allocate_seq`](Self::allocate_seq) returns.
    #[inline]
    pub fn next_seq(&self) -> u16 {
        next_sequence(self.local_seq)
    }

    /// Allocate the next outgoing sequence number.
    pub fn allocate_seq(&mut self) -> u16 {
        self.local_seq = next_sequence(self.local_seq);
        self.local_seq
    }

    /// Ack value for outgoing packets.
    #[inline]
    pub fn remote_seq(&self) -> u16 {
        self.remote_seq
    }

    /// Record a reliable packet that was just sent.
    pub fn track(&mut self, seq: u16, bytes: Vec<u8>, now: Instant) {
        self.pending.insert(seq, PendingSend {
            seq,
            bytes,
            last_sent: now,
            retries: 0,
        });
    }

    /// Account for a received packet.
    ///
    /// The packet's seq becomes the last remote seq (unreliable packets
    /// included) and its ack field is checked against the pending set.
    pub fn observe(&mut self, packet: &Packet) -> Delivery {
        self.remote_seq = packet.seq;
        self.on_ack_observed(packet.ack);

        if !packet.is_reliable() {
            return Delivery::Unreliable;
        }
        if self.recent.contains(&packet.seq) {
            return Delivery::Duplicate;
        }
        if self.recent.len() == DUPLICATE_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(packet.seq);
        Delivery::Fresh
    }

    /// Remove the pending packet with exactly this sequence number.
    ///
    /// Returns whether an entry was removed.
    pub fn on_ack_observed(&mut self, seq: u16) -> bool {
        self.pending.remove(&seq).is_some()
    }

    /// Collect datagrams due for retransmission at `now`.
    ///
    /// An entry is due once more than the retransmit timeout has passed since
    /// it was last sent. Due entries that already used every retry are
    /// dropped without notice.
    pub fn collect_due(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let timeout = self.retransmit_timeout;
        let max_retries = self.max_retries;
        let mut resend = Vec::new();

        self.pending.retain(|seq, item| {
            if now.saturating_duration_since(item.last_sent) <= timeout {
                return true;
            }
            if item.retries >= max_retries {
                debug!(seq, retries = item.retries, "Dropping unacknowledged packet");
                return false;
            }
            item.retries += 1;
            item.last_sent = now;
            resend.push(item.bytes.clone());
            true
        });

        resend
    }

    /// Number of in-flight reliable packets.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Look up an in-flight packet.
    pub fn pending(&self, seq: u16) -> Option<&PendingSend> {
        self.pending.get(&seq)
    }

    /// Forget every in-flight packet.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================
