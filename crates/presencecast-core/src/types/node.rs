//! Node state snapshot
//!
//! A [`PeerSnapshot`] is everything one proxy instance advertises about
//! itself: which clients are connected to it (with a content hash of each
//! client's presence), which room identities those clients hold, and which
//! rooms it knows about. The local snapshot is broadcast periodically as an
//! engine command; remote snapshots are rebuilt from that gossip.
//!
//! ## Wire Format
//!
//! ```json
//! {
//!   "jidMap": {"user1@proxy": "<hash>"},
//!   "nodeId": 7,
//!   "seq": 12,
//!   "mucOccupants": {"user1@proxy": ["room@conference.proxy/user1"]},
//!   "mucRooms": ["room@conference.proxy"],
//!   "connected": true
//! }
//! ```
//!
//! Missing `nodeId` and `seq` decode as 1 and missing `connected` as true.
//! The engine session a remote snapshot arrived on is never serialized.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::TransportResult;
use crate::types::{Jid, NodeId, SessionId};

fn default_node_id() -> NodeId {
    NodeId(1)
}

fn default_seq() -> u64 {
    1
}

fn default_connected() -> bool {
    true
}

/// Advertised state of one proxy instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    /// Client JID -> content hash of its last presence
    #[serde(rename = "jidMap", default)]
    pub identity_hashes: BTreeMap<Jid, String>,

    #[serde(rename = "nodeId", default = "default_node_id")]
    pub node_id: NodeId,

    #[serde(default = "default_seq")]
    pub seq: u64,

    /// Client JID -> in-room identities it holds
    #[serde(rename = "mucOccupants", default)]
    pub room_occupants: BTreeMap<Jid, BTreeSet<Jid>>,

    #[serde(rename = "mucRooms", default)]
    pub known_rooms: BTreeSet<Jid>,

    #[serde(default = "default_connected")]
    pub connected: bool,

    #[serde(skip)]
    pub session: Option<SessionId>,
}

impl PeerSnapshot {
    /// Create an empty, connected snapshot with `seq = 1`.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            identity_hashes: BTreeMap::new(),
            node_id,
            seq: 1,
            room_occupants: BTreeMap::new(),
            known_rooms: BTreeSet::new(),
            connected: true,
            session: None,
        }
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> TransportResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from the JSON wire format.
    pub fn from_json(bytes: &[u8]) -> TransportResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Whether the client is currently advertised.
    pub fn has_identity(&self, jid: &Jid) -> bool {
        self.identity_hashes.contains_key(jid)
    }

    /// `(client, occupant)` pairs whose occupant identity lives in `room`.
    pub fn occupants_in(&self, room: &Jid) -> BTreeSet<(Jid, Jid)> {
        self.room_occupants
            .iter()
            .flat_map(|(client, occupants)| {
                occupants
                    .iter()
                    .filter(|occupant| occupant.bare() == *room)
                    .map(move |occupant| (client.clone(), occupant.clone()))
            })
            .collect()
    }

    /// Every room named either in `mucRooms` or by an occupant identity.
    pub fn referenced_rooms(&self) -> BTreeSet<Jid> {
        let mut rooms = self.known_rooms.clone();
        for occupants in self.room_occupants.values() {
            rooms.extend(occupants.iter().map(Jid::bare));
        }
        rooms
    }

    /// Record an occupant identity for a client.
    pub fn add_occupant(&mut self, client: Jid, occupant: Jid) {
        self.room_occupants.entry(client).or_default().insert(occupant);
    }

    /// Drop an occupant identity; the client entry goes once it is empty.
    pub fn remove_occupant(&mut self, client: &Jid, occupant: &Jid) -> bool {
        let Some(occupants) = self.room_occupants.get_mut(client) else {
            return false;
        };
        let removed = occupants.remove(occupant);
        if occupants.is_empty() {
            self.room_occupants.remove(client);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    #[test]
    fn test_json_keys() {
        let mut snap = PeerSnapshot::new(NodeId(7));
        snap.seq = 12;
        snap.identity_hashes.insert(jid("user1@proxy"), "h1".to_string());
        snap.add_occupant(jid("user1@proxy"), jid("room@conference.proxy/user1"));
        snap.known_rooms.insert(jid("room@conference.proxy"));

        let value: serde_json::Value = serde_json::from_str(&snap.to_json().unwrap()).unwrap();
        assert_eq!(value["jidMap"]["user1@proxy"], "h1");
        assert_eq!(value["nodeId"], 7);
        assert_eq!(value["seq"], 12);
        assert_eq!(value["mucOccupants"]["user1@proxy"][0], "room@conference.proxy/user1");
        assert_eq!(value["mucRooms"][0], "room@conference.proxy");
        assert_eq!(value["connected"], true);
        assert!(value.get("session").is_none());
    }

    #[test]
    fn test_round_trip_drops_session() {
        let mut snap = PeerSnapshot::new(NodeId(2));
        snap.identity_hashes.insert(jid("a@proxy"), "x".to_string());
        snap.session = Some(SessionId(5));

        let back = PeerSnapshot::from_json(snap.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(back.session, None);
        snap.session = None;
        assert_eq!(back, snap);
    }

    #[test]
    fn test_missing_fields_default() {
        let snap = PeerSnapshot::from_json(b"{}").unwrap();
        assert_eq!(snap.node_id, NodeId(1));
        assert_eq!(snap.seq, 1);
        assert!(snap.connected);
        assert!(snap.identity_hashes.is_empty());
        assert!(snap.known_rooms.is_empty());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(PeerSnapshot::from_json(b"<presence/>").is_err());
        assert!(PeerSnapshot::from_json(br#"{"jidMap": {"@": "h"}}"#).is_err());
    }

    #[test]
    fn test_occupants_in_room() {
        let mut snap = PeerSnapshot::new(NodeId(1));
        snap.add_occupant(jid("a@proxy"), jid("room@conference.proxy/a"));
        snap.add_occupant(jid("a@proxy"), jid("other@conference.proxy/a"));
        snap.add_occupant(jid("b@proxy"), jid("room@conference.proxy/bee"));

        let in_room = snap.occupants_in(&jid("room@conference.proxy"));
        assert_eq!(in_room.len(), 2);
        assert!(in_room.contains(&(jid("b@proxy"), jid("room@conference.proxy/bee"))));

        let rooms = snap.referenced_rooms();
        assert!(rooms.contains(&jid("other@conference.proxy")));
    }

    #[test]
    fn test_remove_last_occupant_drops_client() {
        let mut snap = PeerSnapshot::new(NodeId(1));
        snap.add_occupant(jid("a@proxy"), jid("room@conference.proxy/a"));
        assert!(snap.remove_occupant(&jid("a@proxy"), &jid("room@conference.proxy/a")));
        assert!(snap.room_occupants.is_empty());
        assert!(!snap.remove_occupant(&jid("a@proxy"), &jid("room@conference.proxy/a")));
    }
}
