//! Room membership tracking

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::transport::Channel;
use crate::types::{Jid, NodeId, Stanza};

/// One client's identity inside a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupant {
    /// In-room identifier, `room@conference.proxy/nick`
    pub jid: Jid,
    pub nickname: String,
    /// Node that reported this occupant, `None` when local
    pub node_id: Option<NodeId>,
    /// Last presence received for this occupant
    pub presence: Option<Stanza>,
}

impl Occupant {
    /// Create an occupant; the nickname is the resource of `jid`.
    pub fn new(jid: Jid, node_id: Option<NodeId>) -> Self {
        let nickname = jid.resource().unwrap_or_default().to_string();
        Self {
            jid,
            nickname,
            node_id,
            presence: None,
        }
    }
}

/// A room and the occupants known in it, keyed by client JID.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Jid,
    pub occupants: BTreeMap<Jid, Occupant>,
    /// Set when the room has its own multicast group
    pub channel: Option<Arc<Channel>>,
}

impl RoomState {
    pub fn new(room: Jid) -> Self {
        Self {
            room,
            occupants: BTreeMap::new(),
            channel: None,
        }
    }

    /// Clients whose occupant entry was reported by `node`.
    pub fn clients_from(&self, node: NodeId) -> Vec<Jid> {
        self.occupants
            .iter()
            .filter(|(_, occupant)| occupant.node_id == Some(node))
            .map(|(client, _)| client.clone())
            .collect()
    }
}
