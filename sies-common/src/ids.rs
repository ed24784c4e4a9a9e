//! Opaque, UUID-shaped identifiers for protocol messages.
//!
//! The wire protocol treats IDs as opaque strings (spec §6.1: "IDs are
//! opaque strings; implementations SHOULD use a UUID-shaped generator").
//! `MessageId` wraps a `Uuid` so call sites get `Eq`/`Hash`/`Copy` for free
//! while the wire encoding is still a plain string.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A fresh, unique identifier stamped onto every protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID, e.g. one round-tripped from the wire.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}
