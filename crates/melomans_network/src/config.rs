//! Network settings consumed by the router and the task factory.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the melomans networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Multicast group joined for broadcast traffic.
    #[serde(with = "ipv4_serde")]
    pub multicast_address: Ipv4Addr,

    /// UDP port of the multicast group.
    pub multicast_port: u16,

    /// Time-to-live applied to outgoing multicast datagrams.
    pub multicast_ttl: u32,

    /// TCP port accepting point-to-point connections.
    pub listen_port: u16,

    /// Size of receive buffers and of stream chunks written by addressed tasks.
    pub buffer_size: usize,

    /// Timeout for establishing an outbound connection.
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Timeout for the identifier/status exchange on a fresh connection.
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            multicast_address: Ipv4Addr::new(239, 255, 42, 99),
            multicast_port: 9472,
            multicast_ttl: 1,
            listen_port: 9470,
            buffer_size: 8192,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl NetworkSettings {
    /// The multicast group as a socket address.
    pub fn multicast_group(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.multicast_address, self.multicast_port))
    }

    /// Save the settings to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write settings file: {e}"))
    }

    /// Load settings from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkSettings>(&data) {
                    Ok(settings) => return settings,
                    Err(e) => {
                        tracing::warn!("Corrupt settings file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read settings file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod ipv4_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::Ipv4Addr;

    pub fn serialize<S: Serializer>(addr: &Ipv4Addr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Ipv4Addr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
