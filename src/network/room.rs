//! Rooms and Peers
//!
//! A [`Room`] is the immutable description of a hosted game that discovery
//! advertises and joiners connect to. A [`Peer`] is one roster entry.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::PROTOCOL_VERSION;

/// Advertisement key for the game mode.
pub const META_MODE: &str = "mode";
/// Advertisement key for occupancy, formatted `X/Y`.
pub const META_PLAYERS: &str = "players";
/// Advertisement key for the password flag, `1` or `0`.
pub const META_PASSWORD: &str = "pwd";
/// Advertisement key for the protocol version.
pub const META_VERSION: &str = "ver";

/// Player identifier within a room (0 is always the host).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub u8);

impl PlayerId {
    /// The room host.
    pub const HOST: PlayerId = PlayerId(0);

    /// Whether this id belongs to the host.
    pub fn is_host(self) -> bool {
        self == Self::HOST
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Game modes a room can be created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    /// Players cooperate on the same level.
    Coop,
    /// First to the hole wins.
    Race,
    /// Free for all.
    Brawl,
}

impl GameMode {
    /// Advertisement value.
    pub fn as_str(self) -> &'static str {
        match self {
            GameMode::Coop => "coop",
            GameMode::Race => "race",
            GameMode::Brawl => "brawl",
        }
    }
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameMode {
    type Err = RoomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coop" => Ok(GameMode::Coop),
            "race" => Ok(GameMode::Race),
            "brawl" => Ok(GameMode::Brawl),
            other => Err(RoomError::UnknownMode(other.to_string())),
        }
    }
}

/// Errors parsing an advertised room.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    /// Required advertisement key absent.
    #[error("advertisement missing key {0:?}")]
    MissingKey(&'static str),

    /// Mode string not recognised.
    #[error("unknown game mode {0:?}")]
    UnknownMode(String),

    /// `players` value not of the form `X/Y`.
    #[error("malformed player count {0:?}")]
    BadPlayerCount(String),
}

/// A hosted room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    /// Display name.
    pub name: String,
    /// Game mode.
    pub mode: GameMode,
    /// Current player count, host included.
    pub players: u8,
    /// Capacity, host included.
    pub max_players: u8,
    /// Joiners must present the password digest.
    pub has_password: bool,
    /// Address of the host.
    pub host_addr: IpAddr,
    /// Room port.
    pub port: u16,
    /// Advertisement metadata.
    pub metadata: BTreeMap<String, String>,
}

impl Room {
    /// Describe a freshly created room holding only its host.
    pub fn new(
        name: impl Into<String>,
        mode: GameMode,
        has_password: bool,
        host_addr: IpAddr,
        port: u16,
        max_players: u8,
    ) -> Self {
        let mut room = Self {
            name: name.into(),
            mode,
            players: 1,
            max_players,
            has_password,
            host_addr,
            port,
            metadata: BTreeMap::new(),
        };
        room.metadata = room.advertisement();
        room
    }

    /// Endpoint joiners send to.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host_addr, self.port)
    }

    /// Whether another player fits.
    pub fn is_full(&self) -> bool {
        self.players >= self.max_players
    }

    /// Same room with a different occupancy.
    pub fn with_player_count(&self, players: u8) -> Self {
        let mut room = Self {
            players,
            ..self.clone()
        };
        room.metadata = room.advertisement();
        room
    }

    /// Key/value pairs published by discovery.
    pub fn advertisement(&self) -> BTreeMap<String, String> {
        let mut meta = self.metadata.clone();
        meta.insert(META_MODE.into(), self.mode.as_str().into());
        meta.insert(META_PLAYERS.into(), format!("{}/{}", self.players, self.max_players));
        meta.insert(META_PASSWORD.into(), if self.has_password { "1" } else { "0" }.into());
        meta.insert(META_VERSION.into(), PROTOCOL_VERSION.into());
        meta
    }

    /// Rebuild a room from a discovered advertisement.
    pub fn from_advertisement(
        name: impl Into<String>,
        host_addr: IpAddr,
        port: u16,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Self, RoomError> {
        let get = |key: &'static str| metadata.get(key).ok_or(RoomError::MissingKey(key));

        let mode = get(META_MODE)?.parse()?;
        let players_raw = get(META_PLAYERS)?;
        let (players, max_players) = players_raw
            .split_once('/')
            .and_then(|(x, y)| Some((x.trim().parse().ok()?, y.trim().parse().ok()?)))
            .ok_or_else(|| RoomError::BadPlayerCount(players_raw.clone()))?;
        // Missing password flag reads as open
        let has_password = metadata.get(META_PASSWORD).map(|v| v == "1").unwrap_or(false);

        Ok(Self {
            name: name.into(),
            mode,
            players,
            max_players,
            has_password,
            host_addr,
            port,
            metadata: metadata.clone(),
        })
    }
}

/// One roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Id assigned by the host.
    pub player_id: PlayerId,
    /// Display name.
    pub nickname: String,
    /// Ready to start.
    pub ready: bool,
    /// Whether this peer hosts the room.
    pub is_host: bool,
    /// Last measured round-trip time.
    #[serde(default)]
    pub rtt_ms: u32,
}

impl Peer {
    /// The host entry (always player 0).
    pub fn host(nickname: impl Into<String>) -> Self {
        Self {
            player_id: PlayerId::HOST,
            nickname: nickname.into(),
            ready: false,
            is_host: true,
            rtt_ms: 0,
        }
    }

    /// A joiner entry.
    pub fn joiner(player_id: PlayerId, nickname: impl Into<String>) -> Self {
        Self {
            player_id,
            nickname: nickname.into(),
            ready: false,
            is_host: false,
            rtt_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_room() -> Room {
        Room::new("Den", GameMode::Race, true, IpAddr::V4(Ipv4Addr::new(192, 168, 49, 1)), 19999, 4)
    }

    #[test]
    fn test_advertisement_keys() {
        let room = sample_room();
        assert_eq!(room.metadata["mode"], "race");
        assert_eq!(room.metadata["players"], "1/4");
        assert_eq!(room.metadata["pwd"], "1");
        assert_eq!(room.metadata["ver"], "1.0.0");
        assert_eq!(room.addr().to_string(), "192.168.49.1:19999");
    }

    #[test]
    fn test_from_advertisement() {
        let room = sample_room().with_player_count(3);
        let parsed = Room::from_advertisement("Den", room.host_addr, room.port, &room.metadata).unwrap();
        assert_eq!(parsed, room);
        assert_eq!(parsed.players, 3);
        assert!(!parsed.is_full());
    }

    #[test]
    fn test_from_advertisement_errors() {
        let addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let mut meta = BTreeMap::new();
        assert_eq!(
            Room::from_advertisement("x", addr, 1, &meta),
            Err(RoomError::MissingKey("mode"))
        );

        meta.insert("mode".to_string(), "golf".to_string());
        assert!(matches!(
            Room::from_advertisement("x", addr, 1, &meta),
            Err(RoomError::UnknownMode(_))
        ));

        meta.insert("mode".to_string(), "coop".to_string());
        meta.insert("players".to_string(), "three".to_string());
        assert!(matches!(
            Room::from_advertisement("x", addr, 1, &meta),
            Err(RoomError::BadPlayerCount(_))
        ));
    }

    #[test]
    fn test_with_player_count_keeps_original() {
        let room = sample_room();
        let full = room.with_player_count(4);
        assert!(full.is_full());
        assert_eq!(full.metadata["players"], "4/4");
        assert_eq!(room.players, 1);
    }

    #[test]
    fn test_mode_strings() {
        for mode in [GameMode::Coop, GameMode::Race, GameMode::Brawl] {
            assert_eq!(mode.as_str().parse::<GameMode>().unwrap(), mode);
            assert_eq!(serde_json::to_string(&mode).unwrap(), format!("\"{}\"", mode));
        }
    }

    #[test]
    fn test_peer_json() {
        let peer = Peer::joiner(PlayerId(2), "bob");
        let json = serde_json::to_string(&peer).unwrap();
        assert!(json.contains("\"player_id\":2"));
        let back: Peer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, peer);
        assert!(Peer::host("alice").player_id.is_host());
    }
}
