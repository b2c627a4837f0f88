//! Peers ("melomans"): the addressing unit for point-to-point delivery.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// An addressable remote endpoint.
///
/// Two melomans are the same peer when their addresses match; the name is
/// display metadata only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meloman {
    /// Human-readable name of the peer.
    pub name: String,
    /// Address of the peer's point-to-point listener.
    #[serde(with = "socket_addr_serde")]
    pub address: SocketAddr,
}

impl Meloman {
    /// Create a peer with the given name and listener address.
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }

    /// Create an unnamed peer; the address doubles as its name.
    pub fn at(address: SocketAddr) -> Self {
        Self::new(address.to_string(), address)
    }
}

impl PartialEq for Meloman {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Meloman {}

impl Hash for Meloman {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Meloman {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Target of a network task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every member of the multicast group.
    All,
    /// One addressed peer.
    Peer(Meloman),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Peer(peer) => write!(f, "{peer}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helper for SocketAddr
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
