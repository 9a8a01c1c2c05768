//! Core primitives.
//!
//! Nothing in this module touches the network: time source and the
//! handshake digest live here so the protocol layers can be tested in
//! isolation.

pub mod clock;
pub mod hash;

// Re-export core types
pub use clock::{Clock, ManualClock, SystemClock};
pub use hash::{handshake_payload, parse_handshake, password_digest};
