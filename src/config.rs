//! Runtime Configuration
//!
//! Protocol timings and session settings. Every field has a default that
//! matches the wire protocol; `from_env` overrides a subset for the binary.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::{DEFAULT_MAX_PLAYERS, DEFAULT_PORT, TICK_RATE};

/// Address the Wi-Fi Direct group owner takes on its own interface.
pub const GROUP_OWNER_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 49, 1));

/// Level announced by `start_game`.
pub const DEFAULT_LEVEL_ID: &str = "level_1";

/// Settings for one reliable channel (and for each member link on the host).
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Blocking receive timeout. A timeout is "no data this tick".
    pub recv_timeout: Duration,
    /// Time since last send after which a pending packet is resent.
    pub retransmit_timeout: Duration,
    /// Retransmissions per packet before it is dropped.
    pub max_retries: u32,
    /// Receive buffer size in bytes.
    pub recv_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_millis(1000),
            retransmit_timeout: Duration::from_millis(500),
            max_retries: 3,
            recv_buffer_size: 65_536,
        }
    }
}

/// Configuration for a session controller.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Nickname shown to other players.
    pub nickname: String,
    /// Address this device advertises when hosting.
    pub host_ip: IpAddr,
    /// Local address sockets bind to when joining and for the room listener.
    pub bind_ip: IpAddr,
    /// Room port (0 picks an ephemeral port).
    pub port: u16,
    /// Room capacity, host included.
    pub max_players: u8,
    /// Level id carried by SPAWN.
    pub level_id: String,
    /// How long a join waits for WELCOME before giving up.
    pub handshake_timeout: Duration,
    /// Interval between heartbeat pings while in a room.
    pub heartbeat_interval: Duration,
    /// Silence after which the other end of a link is considered gone.
    ///
    /// Both sides ping every heartbeat interval, so this spans several
    /// missed pings.
    pub peer_timeout: Duration,
    /// Session loop cadence.
    pub tick_interval: Duration,
    /// Channel timings.
    pub channel: ChannelConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            nickname: "Player".to_string(),
            host_ip: GROUP_OWNER_IP,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_players: DEFAULT_MAX_PLAYERS,
            level_id: DEFAULT_LEVEL_ID.to_string(),
            handshake_timeout: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(1),
            peer_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(1000 / TICK_RATE as u64),
            channel: ChannelConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            nickname: std::env::var("LANPLAY_NICKNAME").unwrap_or(defaults.nickname),
            host_ip: env_parse("LANPLAY_HOST_IP").unwrap_or(defaults.host_ip),
            bind_ip: env_parse("LANPLAY_BIND_IP").unwrap_or(defaults.bind_ip),
            port: env_parse("LANPLAY_PORT").unwrap_or(defaults.port),
            max_players: env_parse("LANPLAY_MAX_PLAYERS").unwrap_or(defaults.max_players),
            level_id: std::env::var("LANPLAY_LEVEL").unwrap_or(defaults.level_id),
            ..defaults
        }
    }

    /// Loopback settings: everything on 127.0.0.1 with an ephemeral room port.
    pub fn loopback(nickname: &str) -> Self {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self {
            nickname: nickname.to_string(),
            host_ip: localhost,
            bind_ip: localhost,
            port: 0,
            ..Self::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.port, 19999);
        assert_eq!(config.max_players, 4);
        assert_eq!(config.host_ip, GROUP_OWNER_IP);
        assert_eq!(config.tick_interval, Duration::from_millis(16));
        assert_eq!(config.peer_timeout, 5 * config.heartbeat_interval);
        assert_eq!(config.channel.recv_timeout, Duration::from_millis(1000));
        assert_eq!(config.channel.retransmit_timeout, Duration::from_millis(500));
        assert_eq!(config.channel.max_retries, 3);
    }

    #[test]
    fn test_loopback_config() {
        let config = SessionConfig::loopback("alice");
        assert_eq!(config.nickname, "alice");
        assert!(config.host_ip.is_loopback());
        assert_eq!(config.port, 0);
    }
}
