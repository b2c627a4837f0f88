//! Message definitions and the type identifiers used as routing keys.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 64-bit routing key derived from a message's wire definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageTypeId(pub u64);

impl MessageTypeId {
    /// The raw identifier value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for MessageTypeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for MessageTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Function groups a message belongs to.
///
/// Carried as classification metadata only; the router does not enforce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessGroup {
    /// System functions (presence, discovery, settings).
    System,
    /// Commands that drive another peer's player.
    ManipulatePlayer,
    /// Player state announcements.
    Player,
}

impl AccessGroup {
    /// Stable key used when hashing definitions.
    pub fn key(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::ManipulatePlayer => "manipulate_player",
            Self::Player => "player",
        }
    }
}

/// Wire definition of a message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDefinition {
    /// Type name, unique within the application.
    pub name: String,
    /// Revision of the wire shape.
    pub version: u32,
    /// Function group the message belongs to.
    pub access_group: AccessGroup,
    /// Ordered field names making up the wire shape.
    pub fields: Vec<String>,
}

impl MessageDefinition {
    /// Create a definition with no declared fields.
    pub fn new(name: impl Into<String>, version: u32, access_group: AccessGroup) -> Self {
        Self {
            name: name.into(),
            version,
            access_group,
            fields: Vec::new(),
        }
    }

    /// Declare the wire fields of this definition.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

/// A message that can be routed between melomans.
///
/// The body travels as JSON; the definition decides the routing key.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The wire definition of this message type.
    fn definition() -> MessageDefinition;
}

/// Derives routing keys from message definitions.
///
/// Every process on the network must use the same derivation, otherwise
/// identical definitions map to different identifiers.
pub trait MessageService: Send + Sync {
    /// Compute the type identifier for a definition.
    fn type_id(&self, definition: &MessageDefinition) -> MessageTypeId;
}

/// Default [`MessageService`]: first 8 bytes (little-endian) of the SHA-256
/// over the definition's canonical encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefinitionHasher;

impl MessageService for DefinitionHasher {
    fn type_id(&self, definition: &MessageDefinition) -> MessageTypeId {
        let mut hasher = Sha256::new();
        hasher.update(definition.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(definition.version.to_le_bytes());
        hasher.update(definition.access_group.key().as_bytes());
        for field in &definition.fields {
            hasher.update([0u8]);
            hasher.update(field.as_bytes());
        }
        let digest = hasher.finalize();

        let mut id = [0u8; 8];
        id.copy_from_slice(&digest[..8]);
        MessageTypeId(u64::from_le_bytes(id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
