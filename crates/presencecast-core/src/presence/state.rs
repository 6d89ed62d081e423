//! Peer registry and gossip reconciliation
//!
//! [`PresenceState`] is the single owner of everything the presence layer
//! knows: the local snapshot, one record per remote node, the last accepted
//! sequence number per node, room membership and the last presence seen for
//! each remote client. Every mutation returns the notifications and probes
//! it implies as [`Effects`], which the caller delivers after releasing the
//! lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::discovery::DiscoveryEvent;
use crate::transport::Channel;
use crate::types::{Jid, NodeId, Occupant, PeerSnapshot, PresenceType, RoomState, SessionId, Stanza};

/// Status prefix of presences replayed after a peer reconnects
pub const RECONNECTED_PREFIX: &str = "(reconnected) ";

/// What a state change asks the caller to do once the lock is released
#[derive(Debug, Default)]
pub struct Effects {
    pub events: Vec<DiscoveryEvent>,
    /// Presence probes to send on the presence channel
    pub probes: Vec<Stanza>,
    /// A liveness monitor to spawn for a newly tracked node
    pub new_monitor: Option<(NodeId, CancellationToken)>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.probes.is_empty() && self.new_monitor.is_none()
    }
}

/// Result of one liveness tick
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub events: Vec<DiscoveryEvent>,
    /// The monitor should exit
    pub finished: bool,
}

/// What is tracked per remote node
#[derive(Debug)]
struct RemotePeer {
    snapshot: PeerSnapshot,
    /// Liveness ticks left before the node is declared disconnected
    counter: u32,
    /// Ticks spent disconnected
    disconnected_ticks: u32,
    monitor: CancellationToken,
}

/// Owned presence bookkeeping; lives behind one mutex.
#[derive(Debug)]
pub struct PresenceState {
    local: PeerSnapshot,
    peers: HashMap<NodeId, RemotePeer>,
    seqs: HashMap<NodeId, u64>,
    rooms: BTreeMap<Jid, RoomState>,
    last_presence: HashMap<Jid, Stanza>,
    timeout_ticks: u32,
    reap_after_ticks: u32,
    probe_from: Jid,
    monitors: CancellationToken,
}

impl PresenceState {
    /// Create the state for `local_node`.
    ///
    /// Peer monitors get child tokens of `monitors`, so cancelling it stops
    /// them all.
    pub fn new(
        local_node: NodeId,
        timeout_ticks: u32,
        reap_after_ticks: u32,
        probe_from: Jid,
        monitors: CancellationToken,
    ) -> Self {
        Self {
            local: PeerSnapshot::new(local_node),
            peers: HashMap::new(),
            seqs: HashMap::new(),
            rooms: BTreeMap::new(),
            last_presence: HashMap::new(),
            timeout_ticks: timeout_ticks.max(1),
            reap_after_ticks,
            probe_from,
            monitors,
        }
    }

    pub fn local(&self) -> &PeerSnapshot {
        &self.local
    }

    /// The recorded view of a remote node.
    pub fn peer(&self, node: NodeId) -> Option<&PeerSnapshot> {
        self.peers.get(&node).map(|p| &p.snapshot)
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Last accepted snapshot sequence number of a node.
    pub fn last_seq(&self, node: NodeId) -> Option<u64> {
        self.seqs.get(&node).copied()
    }

    /// Liveness ticks left for a node.
    pub fn counter(&self, node: NodeId) -> Option<u32> {
        self.peers.get(&node).map(|p| p.counter)
    }

    pub fn room(&self, room: &Jid) -> Option<&RoomState> {
        self.rooms.get(room)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &RoomState> {
        self.rooms.values()
    }

    /// Last presence received from a remote client.
    pub fn last_presence(&self, client: &Jid) -> Option<&Stanza> {
        self.last_presence.get(client)
    }

    /// The dedicated channel of a room, if it has one.
    pub fn room_channel(&self, room: &Jid) -> Option<Arc<Channel>> {
        self.rooms.get(room).and_then(|r| r.channel.clone())
    }

    /// Attach a dedicated channel to a room, creating the room if needed.
    pub fn set_room_channel(&mut self, room: Jid, channel: Arc<Channel>) {
        self.rooms
            .entry(room.clone())
            .or_insert_with(|| RoomState::new(room))
            .channel = Some(channel);
    }

    /// Bump the local sequence number and return the snapshot to broadcast.
    pub fn next_broadcast(&mut self) -> PeerSnapshot {
        self.local.seq += 1;
        self.local.clone()
    }

    // ------------------------------------------------------------------
    // Local changes
    // ------------------------------------------------------------------

    /// Record a local client's presence; `hash` is its content hash.
    pub fn apply_local_presence(&mut self, presence: &Stanza, hash: String) {
        let Some(from) = presence.from.clone() else {
            return;
        };
        match presence.presence_type() {
            PresenceType::Unavailable => {
                self.local.identity_hashes.remove(&from);
                debug!(jid = %from, "Local client removed");
            }
            PresenceType::Probe => {}
            _ => {
                self.local.identity_hashes.insert(from, hash);
            }
        }
    }

    /// Record a local client entering or leaving a room.
    pub fn apply_local_occupant(&mut self, presence: &Stanza) {
        let (Some(from), Some(to)) = (presence.from.clone(), presence.to.clone()) else {
            return;
        };
        if presence.is_available() {
            self.local.add_occupant(from, to);
        } else {
            self.local.remove_occupant(&from, &to);
        }
    }

    /// Advertise a room; returns the snapshot to send right away.
    pub fn add_local_room(&mut self, room: Jid) -> PeerSnapshot {
        self.rooms
            .entry(room.clone())
            .or_insert_with(|| RoomState::new(room.clone()));
        self.local.known_rooms.insert(room);
        self.next_broadcast()
    }

    // ------------------------------------------------------------------
    // Remote input
    // ------------------------------------------------------------------

    /// Reconcile a full gossip snapshot.
    pub fn apply_snapshot(&mut self, mut snapshot: PeerSnapshot, session: Option<SessionId>) -> Effects {
        let node = snapshot.node_id;
        let mut effects = Effects::default();
        if node == self.local.node_id {
            return effects;
        }
        if let Some(&last) = self.seqs.get(&node) {
            if snapshot.seq <= last {
                trace!(node_id = %node, seq = snapshot.seq, last, "Stale snapshot ignored");
                return effects;
            }
        }
        self.seqs.insert(node, snapshot.seq);
        snapshot.session = session;

        self.track(node, session, &mut effects);
        self.touch(node, &mut effects);

        let Some(peer) = self.peers.get_mut(&node) else {
            return effects;
        };

        // Identities
        for (jid, hash) in &snapshot.identity_hashes {
            match peer.snapshot.identity_hashes.get(jid) {
                Some(known) if known == hash => {}
                known => {
                    let discovered = known.is_none();
                    peer.snapshot.identity_hashes.insert(jid.clone(), hash.clone());
                    effects.probes.push(
                        Stanza::presence_of_type("probe")
                            .with_from(self.probe_from.clone())
                            .with_to(jid.clone()),
                    );
                    if discovered {
                        debug!(node_id = %node, %jid, "Client discovered");
                        effects
                            .events
                            .push(DiscoveryEvent::ClientDiscovered(Stanza::presence().with_from(jid.clone())));
                    } else {
                        debug!(node_id = %node, %jid, "Client hash changed, probing");
                    }
                }
            }
        }
        let gone: Vec<Jid> = peer
            .snapshot
            .identity_hashes
            .keys()
            .filter(|jid| !snapshot.identity_hashes.contains_key(*jid))
            .cloned()
            .collect();
        for jid in gone {
            peer.snapshot.identity_hashes.remove(&jid);
            self.last_presence.remove(&jid);
            debug!(node_id = %node, %jid, "Client no longer advertised");
            effects
                .events
                .push(DiscoveryEvent::ClientRemoved(unavailable_from(&jid)));
        }

        peer.snapshot.known_rooms = snapshot.known_rooms.clone();
        peer.snapshot.room_occupants = snapshot.room_occupants.clone();
        peer.snapshot.seq = snapshot.seq;
        peer.snapshot.session = session;

        // Rooms
        for room in snapshot.referenced_rooms() {
            if !self.rooms.contains_key(&room) {
                info!(node_id = %node, %room, "Room discovered");
                self.rooms.insert(room.clone(), RoomState::new(room.clone()));
                effects.events.push(DiscoveryEvent::RoomAdded(room));
            }
        }

        // Occupants
        for (room_jid, room) in self.rooms.iter_mut() {
            let implied = snapshot.occupants_in(room_jid);
            let exited: Vec<(Jid, Jid)> = room
                .occupants
                .iter()
                .filter(|(client, occupant)| {
                    occupant.node_id == Some(node)
                        && !implied.contains(&((*client).clone(), occupant.jid.clone()))
                })
                .map(|(client, occupant)| (client.clone(), occupant.jid.clone()))
                .collect();
            for (client, occupant_jid) in exited {
                room.occupants.remove(&client);
                effects.events.push(DiscoveryEvent::OccupantExited(
                    Stanza::presence_of_type("unavailable")
                        .with_from(client)
                        .with_to(occupant_jid),
                ));
            }
            for (client, occupant_jid) in implied {
                if room.occupants.contains_key(&client) {
                    continue;
                }
                let mut presence = Stanza::presence()
                    .with_from(client.clone())
                    .with_to(occupant_jid.clone());
                presence.add_muc_marker();
                let mut occupant = Occupant::new(occupant_jid, Some(node));
                occupant.presence = Some(presence.clone());
                room.occupants.insert(client, occupant);
                effects.events.push(DiscoveryEvent::OccupantJoined(presence));
            }
        }

        effects
    }

    /// Ingest a client presence sent directly by `node`.
    pub fn apply_presence(&mut self, node: NodeId, presence: &Stanza, hash: String) -> Effects {
        let mut effects = Effects::default();
        let Some(from) = presence.from.clone() else {
            debug!(node_id = %node, "Presence without sender ignored");
            return effects;
        };
        if node == self.local.node_id {
            return effects;
        }
        self.track(node, None, &mut effects);
        self.touch(node, &mut effects);
        let Some(peer) = self.peers.get_mut(&node) else {
            return effects;
        };

        match presence.presence_type() {
            PresenceType::Probe | PresenceType::Other(_) => {
                effects.events.push(DiscoveryEvent::ClientUpdated(presence.clone()));
            }
            PresenceType::Available => {
                self.last_presence.insert(from.clone(), presence.clone());
                let known = peer.snapshot.identity_hashes.insert(from, hash).is_some();
                effects.events.push(if known {
                    DiscoveryEvent::ClientUpdated(presence.clone())
                } else {
                    DiscoveryEvent::ClientDiscovered(presence.clone())
                });
            }
            PresenceType::Unavailable => {
                peer.snapshot.identity_hashes.remove(&from);
                self.last_presence.remove(&from);
                effects.events.push(DiscoveryEvent::ClientRemoved(presence.clone()));
            }
        }
        effects
    }

    /// Ingest a room presence sent directly by `node`.
    pub fn apply_muc_presence(&mut self, node: NodeId, presence: &Stanza) -> Effects {
        let mut effects = Effects::default();
        let (Some(client), Some(occupant_jid)) = (presence.from.clone(), presence.to.clone()) else {
            debug!(node_id = %node, "Room presence without from/to ignored");
            return effects;
        };
        if node == self.local.node_id {
            return effects;
        }
        self.track(node, None, &mut effects);
        self.touch(node, &mut effects);

        let room_jid = occupant_jid.bare();
        let room = match self.rooms.get_mut(&room_jid) {
            Some(room) => room,
            None => {
                effects.events.push(DiscoveryEvent::RoomAdded(room_jid.clone()));
                self.rooms
                    .entry(room_jid.clone())
                    .or_insert_with(|| RoomState::new(room_jid.clone()))
            }
        };

        if presence.is_available() {
            let mut occupant = Occupant::new(occupant_jid, Some(node));
            occupant.presence = Some(presence.clone());
            let event = if room.occupants.contains_key(&client) {
                DiscoveryEvent::OccupantUpdated(presence.clone())
            } else {
                DiscoveryEvent::OccupantJoined(presence.clone())
            };
            room.occupants.insert(client, occupant);
            effects.events.push(event);
        } else {
            room.occupants.remove(&client);
            effects.events.push(DiscoveryEvent::OccupantExited(presence.clone()));
        }
        effects
    }

    /// Register a node heard by the engine before any gossip.
    pub fn add_remote_node(&mut self, node: NodeId, session: SessionId) -> Effects {
        let mut effects = Effects::default();
        if node != self.local.node_id {
            self.track(node, Some(session), &mut effects);
        }
        effects
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    /// Advance a node's liveness monitor by one tick.
    pub fn tick(&mut self, node: NodeId) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let Some(peer) = self.peers.get_mut(&node) else {
            outcome.finished = true;
            return outcome;
        };

        if peer.snapshot.connected {
            peer.counter = peer.counter.saturating_sub(1);
            trace!(node_id = %node, counter = peer.counter, "Liveness tick");
            if peer.counter == 0 {
                peer.snapshot.connected = false;
                peer.disconnected_ticks = 0;
                info!(node_id = %node, clients = peer.snapshot.identity_hashes.len(), "Node disconnected");
                for jid in peer.snapshot.identity_hashes.keys() {
                    outcome
                        .events
                        .push(DiscoveryEvent::ClientDisconnected(jid.clone()));
                }
            }
            return outcome;
        }

        peer.disconnected_ticks += 1;
        if self.reap_after_ticks > 0 && peer.disconnected_ticks >= self.reap_after_ticks {
            outcome.events = self.reap(node);
            outcome.finished = true;
        }
        outcome
    }

    /// Forget a node entirely.
    fn reap(&mut self, node: NodeId) -> Vec<DiscoveryEvent> {
        let mut events = Vec::new();
        let Some(peer) = self.peers.remove(&node) else {
            return events;
        };
        self.seqs.remove(&node);
        peer.monitor.cancel();
        info!(node_id = %node, "Reaping disconnected node");

        for jid in peer.snapshot.identity_hashes.keys() {
            self.last_presence.remove(jid);
            events.push(DiscoveryEvent::ClientRemoved(unavailable_from(jid)));
        }

        for room in self.rooms.values_mut() {
            let clients = room.clients_from(node);
            for client in clients {
                if let Some(occupant) = room.occupants.remove(&client) {
                    events.push(DiscoveryEvent::OccupantExited(
                        Stanza::presence_of_type("unavailable")
                            .with_from(client)
                            .with_to(occupant.jid),
                    ));
                }
            }
        }

        // Rooms nobody else vouches for
        let still_advertised: BTreeSet<Jid> = self
            .peers
            .values()
            .flat_map(|p| p.snapshot.referenced_rooms())
            .chain(self.local.referenced_rooms())
            .collect();
        for room in peer.snapshot.known_rooms {
            let orphaned = self.rooms.get(&room).is_some_and(|r| {
                r.occupants.is_empty() && r.channel.is_none() && !still_advertised.contains(&room)
            });
            if orphaned {
                self.rooms.remove(&room);
                events.push(DiscoveryEvent::RoomRemoved(room));
            }
        }
        events
    }

    /// Cancel every peer monitor.
    pub fn cancel_monitors(&mut self) {
        self.monitors.cancel();
    }

    /// Start tracking `node` if it is new.
    fn track(&mut self, node: NodeId, session: Option<SessionId>, effects: &mut Effects) {
        if self.peers.contains_key(&node) {
            return;
        }
        let monitor = self.monitors.child_token();
        let mut snapshot = PeerSnapshot::new(node);
        snapshot.seq = 0;
        snapshot.session = session;
        self.peers.insert(
            node,
            RemotePeer {
                snapshot,
                counter: self.timeout_ticks,
                disconnected_ticks: 0,
                monitor: monitor.clone(),
            },
        );
        info!(node_id = %node, "Tracking new node");
        effects.new_monitor = Some((node, monitor));
    }

    /// Record activity from `node`, reconnecting it if needed.
    fn touch(&mut self, node: NodeId, effects: &mut Effects) {
        let Some(peer) = self.peers.get_mut(&node) else {
            return;
        };
        peer.counter = self.timeout_ticks;
        peer.disconnected_ticks = 0;
        if peer.snapshot.connected {
            return;
        }
        peer.snapshot.connected = true;
        info!(node_id = %node, "Node reconnected");
        for jid in peer.snapshot.identity_hashes.keys() {
            let mut presence = self
                .last_presence
                .get(jid)
                .cloned()
                .unwrap_or_else(|| Stanza::presence().with_from(jid.clone()));
            let previous = presence.status.take().unwrap_or_default();
            presence.status = Some(format!("{}{}", RECONNECTED_PREFIX, previous));
            effects.events.push(DiscoveryEvent::ClientReconnected(presence));
        }
    }
}

fn unavailable_from(jid: &Jid) -> Stanza {
    Stanza::presence_of_type("unavailable").with_from(jid.clone())
}
