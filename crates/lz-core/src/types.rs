//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::str::FromStr;

/// Network identity of a peer.
///
/// Agents and consoles are identified by IP address alone; the port is a
/// per-population setting, not part of the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddr(pub IpAddr);

impl PeerAddr {
    /// Create a peer address
    pub fn new(ip: IpAddr) -> Self {
        Self(ip)
    }

    /// The underlying IP address
    pub fn ip(&self) -> IpAddr {
        self.0
    }

    /// Numeric device id: the last octet of the address
    pub fn device_id(&self) -> u8 {
        match self.0 {
            IpAddr::V4(v4) => v4.octets()[3],
            IpAddr::V6(v6) => v6.octets()[15],
        }
    }

    /// WebSocket URL for this peer on the given port
    pub fn ws_url(&self, port: u16) -> String {
        format!("ws://{}", SocketAddr::new(self.0, port))
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<IpAddr>().map(Self)
    }
}

impl From<IpAddr> for PeerAddr {
    fn from(ip: IpAddr) -> Self {
        Self(ip)
    }
}

/// Which population a connection belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Fleet terminal
    Agent,
    /// Operator console
    App,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Agent => write!(f, "agent"),
            PeerRole::App => write!(f, "app"),
        }
    }
}

/// Supervisor-side link state for one address.
///
/// `Disconnected -> Connecting -> Connected -> Disconnected`. A failed
/// connect attempt goes straight back to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkState {
    /// No session; eligible for a connect attempt
    #[default]
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// A session was opened
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
        }
    }
}
