//! Room Discovery
//!
//! The session layer does not know how rooms become visible on the network.
//! It registers its own room through [`DiscoveryAdapter::advertise`] and
//! reads candidate rooms from a watch channel whose value is replaced
//! wholesale on every refresh.
//!
//! [`LocalDiscovery`] is an in-process registry: adapters created from the
//! same registry see each other's rooms.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use super::room::Room;

/// Discovery failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// The platform cannot advertise rooms.
    #[error("discovery unsupported on this device")]
    Unsupported,

    /// Advertisement failed.
    #[error("discovery failed: {0}")]
    Failed(String),
}

/// Room advertisement and discovery.
pub trait DiscoveryAdapter: Send + Sync {
    /// Publish a room, replacing any earlier advertisement from this adapter.
    fn advertise(&self, room: &Room) -> Result<(), DiscoveryError>;

    /// Stop advertising. No-op when nothing is advertised.
    fn withdraw(&self);

    /// Currently visible rooms.
    fn rooms(&self) -> watch::Receiver<Vec<Room>>;
}

/// In-process room registry.
pub struct LocalDiscovery {
    registry: Arc<watch::Sender<Vec<Room>>>,
    advertised: Mutex<Option<SocketAddr>>,
}

impl LocalDiscovery {
    /// Create an adapter with a fresh registry.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self {
            registry: Arc::new(tx),
            advertised: Mutex::new(None),
        }
    }

    /// Another adapter on the same registry, as a second device would be.
    pub fn peer(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            advertised: Mutex::new(None),
        }
    }

    fn advertised(&self) -> std::sync::MutexGuard<'_, Option<SocketAddr>> {
        self.advertised.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for LocalDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryAdapter for LocalDiscovery {
    fn advertise(&self, room: &Room) -> Result<(), DiscoveryError> {
        // Only what an advertisement carries survives the trip
        let published = Room::from_advertisement(room.name.clone(), room.host_addr, room.port, &room.advertisement())
            .map_err(|e| DiscoveryError::Failed(e.to_string()))?;

        let mut advertised = self.advertised();
        let previous = advertised.replace(room.addr());
        self.registry.send_modify(|rooms| {
            rooms.retain(|r| Some(r.addr()) != previous);
            rooms.push(published);
        });

        debug!(room = %room.name, players = room.players, "Advertised room");
        Ok(())
    }

    fn withdraw(&self) {
        if let Some(addr) = self.advertised().take() {
            self.registry.send_modify(|rooms| rooms.retain(|r| r.addr() != addr));
            info!(%addr, "Withdrew room advertisement");
        }
    }

    fn rooms(&self) -> watch::Receiver<Vec<Room>> {
        self.registry.subscribe()
    }
}

/// Adapter for devices without a discovery transport.
pub struct UnsupportedDiscovery {
    rooms: watch::Sender<Vec<Room>>,
}

impl UnsupportedDiscovery {
    /// Create the adapter.
    pub fn new() -> Self {
        let (rooms, _rx) = watch::channel(Vec::new());
        Self { rooms }
    }
}

impl Default for UnsupportedDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryAdapter for UnsupportedDiscovery {
    fn advertise(&self, _room: &Room) -> Result<(), DiscoveryError> {
        Err(DiscoveryError::Unsupported)
    }

    fn withdraw(&self) {}

    fn rooms(&self) -> watch::Receiver<Vec<Room>> {
        self.rooms.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::room::GameMode;
    use std::net::{IpAddr, Ipv4Addr};

    fn room(port: u16) -> Room {
        Room::new("Den", GameMode::Coop, false, IpAddr::V4(Ipv4Addr::LOCALHOST), port, 4)
    }

    #[test]
    fn test_peers_share_registry() {
        let host = LocalDiscovery::new();
        let joiner = host.peer();
        let rooms = joiner.rooms();
        assert!(rooms.borrow().is_empty());

        host.advertise(&room(4000)).unwrap();
        assert_eq!(rooms.borrow().len(), 1);
        assert_eq!(rooms.borrow()[0].port, 4000);

        host.withdraw();
        assert!(rooms.borrow().is_empty());
        // Second withdraw is harmless
        host.withdraw();
    }

    #[test]
    fn test_readvertise_replaces_entry() {
        let host = LocalDiscovery::new();
        let first = room(4000);
        host.advertise(&first).unwrap();
        host.advertise(&first.with_player_count(2)).unwrap();

        let rooms = host.rooms();
        let rooms = rooms.borrow();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].players, 2);
    }

    #[test]
    fn test_withdraw_leaves_other_rooms() {
        let a = LocalDiscovery::new();
        let b = a.peer();
        a.advertise(&room(4000)).unwrap();
        b.advertise(&room(4001)).unwrap();

        a.withdraw();
        let rooms = b.rooms();
        let rooms = rooms.borrow();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].port, 4001);
    }

    #[test]
    fn test_unsupported() {
        let discovery = UnsupportedDiscovery::new();
        assert_eq!(discovery.advertise(&room(1)), Err(DiscoveryError::Unsupported));
        assert!(discovery.rooms().borrow().is_empty());
    }
}
