//! Payload Formats
//!
//! What rides inside the packet payload for each packet type. Structured
//! payloads are JSON for debugging ease; the rest are short UTF-8 strings
//! or fixed binary fields.

use serde::{Deserialize, Serialize};

use super::room::{Peer, PlayerId};

/// Length of a heartbeat ping payload.
pub const PING_LEN: usize = 8;

/// Prefix of a DISCONNECT payload carrying a reason.
pub const REASON_PREFIX: &str = "reason=";

// =============================================================================
// JSON PAYLOADS
// =============================================================================

/// WELCOME: the receiver's player id and the full roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeMessage {
    /// Id of the member this copy is addressed to.
    pub player_id: PlayerId,
    /// Everyone in the room, ordered by id.
    pub roster: Vec<Peer>,
}

/// STATE: a member changing its own roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerUpdate {
    /// Ready flag.
    pub ready: bool,
    /// New nickname, if changed.
    #[serde(default)]
    pub nickname: Option<String>,
}

/// CHAT: one line of text.
///
/// The host overwrites `from` and `nickname` when relaying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender.
    pub from: PlayerId,
    /// Sender nickname.
    pub nickname: String,
    /// Message text.
    pub text: String,
}

macro_rules! json_payload {
    ($($ty:ty),+) => {$(
        impl $ty {
            /// Serialize to a JSON payload.
            pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
                serde_json::to_vec(self)
            }

            /// Deserialize from a JSON payload.
            pub fn from_payload(data: &[u8]) -> Result<Self, serde_json::Error> {
                serde_json::from_slice(data)
            }
        }
    )+};
}

json_payload!(WelcomeMessage, PeerUpdate, ChatMessage);

// =============================================================================
// DISCONNECT REASONS
// =============================================================================

/// Why the host refused or ended a membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Password digest did not match.
    BadPassword,
    /// Room at capacity.
    RoomFull,
    /// Host left.
    RoomClosed,
    /// Any other code.
    Other(String),
}

impl RejectReason {
    /// Wire code.
    pub fn code(&self) -> &str {
        match self {
            RejectReason::BadPassword => "bad_password",
            RejectReason::RoomFull => "room_full",
            RejectReason::RoomClosed => "room_closed",
            RejectReason::Other(code) => code,
        }
    }

    /// Parse a wire code.
    pub fn from_code(code: &str) -> Self {
        match code {
            "bad_password" => RejectReason::BadPassword,
            "room_full" => RejectReason::RoomFull,
            "room_closed" => RejectReason::RoomClosed,
            other => RejectReason::Other(other.to_string()),
        }
    }

    /// DISCONNECT payload carrying this reason.
    pub fn to_payload(&self) -> Vec<u8> {
        format!("{}{}", REASON_PREFIX, self.code()).into_bytes()
    }

    /// Reason carried by a DISCONNECT payload, if any.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?;
        let code = text.strip_prefix(REASON_PREFIX)?;
        Some(Self::from_code(code.trim()))
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

// =============================================================================
// HEARTBEAT / SPAWN
// =============================================================================

/// Ping payload: sender timestamp in milliseconds, big-endian.
pub fn encode_ping(timestamp_ms: u64) -> [u8; PING_LEN] {
    timestamp_ms.to_be_bytes()
}

/// Timestamp of a ping payload. Empty (ack-only) heartbeats yield `None`.
pub fn decode_ping(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; PING_LEN] = payload.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Level id carried by SPAWN.
pub fn decode_level(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

// =============================================================================
// TESTS
// =============================================================================
