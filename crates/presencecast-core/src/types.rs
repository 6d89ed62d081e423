//! Core types for presencecast
//!
//! Identifiers shared by every layer plus the peer state model:
//! [`PeerSnapshot`] (what a node advertises), [`RoomState`] and [`Occupant`]
//! (who is in which room), and the [`Jid`]/[`Stanza`] pair used to read
//! presence payloads.

pub mod jid;
pub mod node;
pub mod room;
pub mod stanza;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use jid::Jid;
pub use node::PeerSnapshot;
pub use room::{Occupant, RoomState};
pub use stanza::{PresenceType, Stanza, StanzaKind};

/// Identifier of a proxy instance on the multicast network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Get the raw value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Handle of one engine session (one interface, group and port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}
