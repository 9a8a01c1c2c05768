//! Network Layer
//!
//! Reliable delivery over UDP and the room/session state machine on top.
//! Leaf modules (`packet`, `reliability`) are socket-free; everything that
//! touches the network goes through `transport`.

pub mod channel;
pub mod discovery;
pub mod host;
pub mod packet;
pub mod protocol;
pub mod reliability;
pub mod room;
pub mod service;
pub mod session;
pub mod transport;

pub use channel::{ChannelError, Inbound, ReliableChannel};
pub use discovery::{DiscoveryAdapter, DiscoveryError, LocalDiscovery, UnsupportedDiscovery};
pub use host::{RoomHost, RoomHostHandle};
pub use packet::{Packet, PacketError, PacketType};
pub use protocol::{ChatMessage, PeerUpdate, RejectReason, WelcomeMessage};
pub use reliability::ReliabilityTracker;
pub use room::{GameMode, Peer, PlayerId, Room, RoomError};
pub use service::{SessionHandle, SessionService};
pub use session::{
    JoinFailure, SessionContext, SessionController, SessionError, SessionEvent, SessionSnapshot,
    SessionState,
};
pub use transport::{DatagramSocket, SocketBinder, UdpBinder, UdpTransport};
