//! Packet Codec
//!
//! Wire format for every datagram. All multi-byte fields are big-endian.
//!
//! ```text
//! offset  size  field
//!   0      1    packet type id
//!   1      2    sequence number (0 = unreliable)
//!   3      2    acknowledgment number
//!   5      4    reserved, always zero
//!   9      2    payload length
//!  11      1    checksum: sum of bytes 0..=10 mod 256
//!  12      N    payload
//! ```
//!
//! The reserved bytes were set aside for a selective-ack bitmap that the
//! protocol never defined. They are written as zero and ignored on decode.

use thiserror::Error;

/// Size of the fixed header.
pub const HEADER_LEN: usize = 12;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Largest datagram a UDP socket will send over IPv4.
///
/// The length field allows payloads past this, but such packets fail with
/// `EMSGSIZE` on every send.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Sequence number carried by unreliable packets.
pub const UNRELIABLE_SEQ: u16 = 0;

const OFF_TYPE: usize = 0;
const OFF_SEQ: usize = 1;
const OFF_ACK: usize = 3;
const OFF_LEN: usize = 9;
const OFF_CHECKSUM: usize = 11;

/// Protocol packet types.
///
/// Discriminants are the on-wire type ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Join request carrying the password digest.
    Handshake = 0,
    /// Admission: assigned player id plus the roster.
    Welcome = 1,
    /// Keep-alive, ack carrier and RTT ping.
    Heartbeat = 2,
    /// Player input.
    Input = 3,
    /// Peer state (ready flag, nickname).
    State = 4,
    /// Level spawn / game start.
    Spawn = 5,
    /// Damage event.
    Damage = 6,
    /// Item event.
    Item = 7,
    /// Chat line.
    Chat = 8,
    /// Host migration.
    Migrate = 9,
    /// Leave, rejection or room closure.
    Disconnect = 10,
}

impl PacketType {
    /// All packet types in id order.
    pub const ALL: [PacketType; 11] = [
        PacketType::Handshake,
        PacketType::Welcome,
        PacketType::Heartbeat,
        PacketType::Input,
        PacketType::State,
        PacketType::Spawn,
        PacketType::Damage,
        PacketType::Item,
        PacketType::Chat,
        PacketType::Migrate,
        PacketType::Disconnect,
    ];

    /// Wire id.
    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Look up a type by wire id.
    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Self::from_id(id).ok_or(PacketError::UnknownType(id))
    }
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type.
    pub kind: PacketType,
    /// Sender-assigned sequence number (0 for unreliable packets).
    pub seq: u16,
    /// Last sequence number the sender had seen from us.
    pub ack: u16,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a packet.
    pub fn new(kind: PacketType, seq: u16, ack: u16, payload: Vec<u8>) -> Self {
        Self { kind, seq, ack, payload }
    }

    /// Whether the sender expects this packet to be acknowledged.
    #[inline]
    pub fn is_reliable(&self) -> bool {
        self.seq != UNRELIABLE_SEQ
    }

    /// Encode this packet.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        encode(self.kind, self.seq, self.ack, &self.payload)
    }

    /// Size on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Whether the encoded packet fits in one UDP datagram.
    #[inline]
    pub fn fits_datagram(&self) -> bool {
        self.wire_len() <= MAX_DATAGRAM_LEN
    }
}

/// Packet codec errors.
///
/// Receivers treat every decode error as a silent drop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Datagram shorter than the header.
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    /// Header checksum does not match.
    #[error("checksum mismatch: header says {expected:#04x}, computed {actual:#04x}")]
    ChecksumMismatch {
        /// Checksum byte from the header.
        expected: u8,
        /// Checksum computed over bytes 0..=10.
        actual: u8,
    },

    /// Declared payload length differs from the bytes present.
    #[error("payload length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch {
        /// Length from the header.
        declared: usize,
        /// Trailing byte count.
        actual: usize,
    },

    /// Type id is not a known packet type.
    #[error("unknown packet type {0}")]
    UnknownType(u8),

    /// Payload does not fit the 16-bit length field.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Checksum over header bytes 0..=10.
#[inline]
pub fn header_checksum(header: &[u8]) -> u8 {
    header[..OFF_CHECKSUM]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Encode a packet into a new buffer.
///
/// Fails only when the payload exceeds [`MAX_PAYLOAD_LEN`].
pub fn encode(kind: PacketType, seq: u16, ack: u16, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    let len = u16::try_from(payload.len()).map_err(|_| PacketError::PayloadTooLarge(payload.len()))?;

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(kind.id());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&ack.to_be_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(&len.to_be_bytes());
    let checksum = header_checksum(&buf);
    buf.push(checksum);
    buf.extend_from_slice(payload);

    Ok(buf)
}

/// Decode a datagram.
pub fn decode(data: &[u8]) -> Result<Packet, PacketError> {
    if data.len() < HEADER_LEN {
        return Err(PacketError::TooShort(data.len()));
    }

    let expected = data[OFF_CHECKSUM];
    let actual = header_checksum(data);
    if expected != actual {
        return Err(PacketError::ChecksumMismatch { expected, actual });
    }

    let declared = u16::from_be_bytes([data[OFF_LEN], data[OFF_LEN + 1]]) as usize;
    let trailing = data.len() - HEADER_LEN;
    if declared != trailing {
        return Err(PacketError::LengthMismatch { declared, actual: trailing });
    }

    let kind = PacketType::try_from(data[OFF_TYPE])?;
    let seq = u16::from_be_bytes([data[OFF_SEQ], data[OFF_SEQ + 1]]);
    let ack = u16::from_be_bytes([data[OFF_ACK], data[OFF_ACK + 1]]);

    Ok(Packet {
        kind,
        seq,
        ack,
        payload: data[HEADER_LEN..].to_vec(),
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_heartbeat_header_bytes() {
        let bytes = encode(PacketType::Heartbeat, 1, 0, &[]).unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..11], &[2, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(bytes[11], 3);
    }

    #[test]
    fn test_big_endian_fields() {
        let bytes = encode(PacketType::Chat, 0x1234, 0xABCD, b"hi").unwrap();
        assert_eq!(bytes[0], 8);
        assert_eq!(&bytes[1..3], &[0x12, 0x34]);
        assert_eq!(&bytes[3..5], &[0xAB, 0xCD]);
        assert_eq!(&bytes[5..9], &[0, 0, 0, 0]);
        assert_eq!(&bytes[9..11], &[0, 2]);
        assert_eq!(&bytes[12..], b"hi");

        let sum: u32 = bytes[..11].iter().map(|b| *b as u32).sum();
        assert_eq!(bytes[11] as u32, sum % 256);
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        let result = encode(PacketType::State, 1, 0, &payload);
        assert_eq!(result, Err(PacketError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1)));

        let payload = vec![7u8; MAX_PAYLOAD_LEN];
        let bytes = encode(PacketType::State, 1, 0, &payload).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + MAX_PAYLOAD_LEN);
        assert_eq!(decode(&bytes).unwrap().payload.len(), MAX_PAYLOAD_LEN);
    }

    #[test]
    fn test_datagram_limit() {
        let fits = Packet::new(PacketType::Chat, 1, 0, vec![0; MAX_DATAGRAM_LEN - HEADER_LEN]);
        assert_eq!(fits.wire_len(), MAX_DATAGRAM_LEN);
        assert!(fits.fits_datagram());
        assert_eq!(fits.encode().unwrap().len(), MAX_DATAGRAM_LEN);

        // Encodable, but no socket will send it
        let oversized = Packet::new(PacketType::Chat, 1, 0, vec![0; MAX_DATAGRAM_LEN - HEADER_LEN + 1]);
        assert!(!oversized.fits_datagram());
        assert!(oversized.encode().is_ok());
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(decode(&[]), Err(PacketError::TooShort(0)));
        assert_eq!(decode(&[2, 0, 1]), Err(PacketError::TooShort(3)));
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut bytes = encode(PacketType::Chat, 3, 0, b"hello").unwrap();
        bytes.push(b'!');
        assert_eq!(
            decode(&bytes),
            Err(PacketError::LengthMismatch { declared: 5, actual: 6 })
        );

        bytes.truncate(HEADER_LEN + 2);
        assert!(matches!(decode(&bytes), Err(PacketError::LengthMismatch { .. })));
    }

    #[test]
    fn test_decode_unknown_type() {
        // Valid checksum over an unknown type id
        let mut bytes = vec![11, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        bytes[11] = header_checksum(&bytes);
        assert_eq!(decode(&bytes), Err(PacketError::UnknownType(11)));
    }

    #[test]
    fn test_reserved_bytes_ignored_when_checksum_matches() {
        let mut bytes = encode(PacketType::Heartbeat, 9, 4, &[]).unwrap();
        bytes[6] = 0x80;
        bytes[11] = header_checksum(&bytes);
        let packet = decode(&bytes).unwrap();
        assert_eq!(packet.seq, 9);
        assert_eq!(packet.ack, 4);
    }

    #[test]
    fn test_type_ids() {
        for (i, kind) in PacketType::ALL.iter().enumerate() {
            assert_eq!(kind.id() as usize, i);
            assert_eq!(PacketType::from_id(i as u8), Some(*kind));
        }
        assert_eq!(PacketType::from_id(11), None);
        assert_eq!(PacketType::from_id(255), None);
    }

    #[test]
    fn test_reliability_marker() {
        assert!(!Packet::new(PacketType::Heartbeat, 0, 5, vec![]).is_reliable());
        assert!(Packet::new(PacketType::Chat, 1, 0, vec![]).is_reliable());
    }

    fn packet_type() -> impl Strategy<Value = PacketType> {
        (0u8..11).prop_map(|id| PacketType::from_id(id).unwrap())
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            kind in packet_type(),
            seq in any::<u16>(),
            ack in any::<u16>(),
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let bytes = encode(kind, seq, ack, &payload).unwrap();
            prop_assert_eq!(bytes.len(), HEADER_LEN + payload.len());

            let packet = decode(&bytes).unwrap();
            prop_assert_eq!(packet, Packet::new(kind, seq, ack, payload));
        }

        #[test]
        fn prop_single_header_byte_corruption_rejected(
            kind in packet_type(),
            seq in any::<u16>(),
            ack in any::<u16>(),
            payload in proptest::collection::vec(any::<u8>(), 0..64),
            index in 0usize..HEADER_LEN,
            delta in 1u8..=255,
        ) {
            let mut bytes = encode(kind, seq, ack, &payload).unwrap();
            bytes[index] = bytes[index].wrapping_add(delta);
            prop_assert!(decode(&bytes).is_err());
        }
    }
}
