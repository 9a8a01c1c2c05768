//! # Lanplay Session Layer
//!
//! Peer-to-peer session core for a local-network multiplayer game: a small
//! reliable-delivery protocol over UDP plus the room lifecycle (create,
//! discover, join, leave, start) that rides on it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     LANPLAY SESSION CORE                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  config.rs       - Protocol constants and runtime settings   │
//! │                                                              │
//! │  core/           - Transport-agnostic primitives             │
//! │  ├── clock.rs    - Injectable time source                    │
//! │  └── hash.rs     - Handshake password digest                 │
//! │                                                              │
//! │  network/        - Protocol and session                      │
//! │  ├── packet.rs      - 12-byte header wire codec              │
//! │  ├── reliability.rs - Seq/ack bookkeeping, retransmission    │
//! │  ├── transport.rs   - Datagram socket abstraction            │
//! │  ├── channel.rs     - Reliable channel to one remote         │
//! │  ├── room.rs        - Room and peer model                    │
//! │  ├── protocol.rs    - Structured payloads                    │
//! │  ├── discovery.rs   - Discovery adapter contract             │
//! │  ├── host.rs        - Group-owner endpoint (room port)       │
//! │  ├── session.rs     - Session state machine                  │
//! │  └── service.rs     - Single-owner actor + handle            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! Control: UI → `SessionHandle` → `SessionController` → `ReliableChannel` → UDP.
//! Events: UDP → `ReliableChannel` → `SessionController` → broadcast/watch → UI.
//!
//! The host runs a [`network::RoomHost`] on the room port and connects its own
//! channel to it, so host and joiners share one send path.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod network;

// Re-export commonly used types
pub use config::{ChannelConfig, SessionConfig};
pub use crate::core::clock::{Clock, ManualClock, SystemClock};
pub use network::{
    DiscoveryAdapter, GameMode, LocalDiscovery, Packet, PacketType, Peer, PlayerId,
    ReliableChannel, Room, SessionContext, SessionController, SessionEvent, SessionHandle,
    SessionService, SessionSnapshot, SessionState,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version advertised in room metadata.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Default UDP port for rooms.
pub const DEFAULT_PORT: u16 = 19999;

/// Default room capacity, host included.
pub const DEFAULT_MAX_PLAYERS: u8 = 4;

/// Session loop rate (Hz).
pub const TICK_RATE: u32 = 60;
