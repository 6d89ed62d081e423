use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::liveness::{self, broadcast_loop, monitor_loop};
use super::state::{Effects, PresenceState};
use crate::config::PresenceConfig;
use crate::discovery::{DiscoveryEvent, DiscoveryListener};
use crate::error::{TransportError, TransportResult};
use crate::hash::PresenceHasher;
use crate::transport::{Channel, ChannelHandler};
use crate::types::{Jid, NodeId, Occupant, PeerSnapshot, SessionId, Stanza};
use crate::wire::{TransportMetadata, TransportSubType, TransportType, WireCodec};

/// The presence channel: a [`Channel`] plus gossip state and tasks.
///
/// Always handled through an `Arc`; background tasks keep a weak
/// reference and stop once the channel is dropped or closed.
pub struct PresenceChannel {
    me: Weak<PresenceChannel>,
    channel: Channel,
    state: Mutex<PresenceState>,
    listener: Arc<dyn DiscoveryListener>,
    pub(super) hasher: Arc<dyn PresenceHasher>,
    config: PresenceConfig,
    grtt: Mutex<Option<Duration>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PresenceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceChannel")
            .field("channel", &self.channel)
            .field("config", &self.config)
            .finish()
    }
}

impl PresenceChannel {
    /// Wrap `channel` as the presence channel.
    ///
    /// Nothing is sent until [`start`](Self::start) is called.
    pub fn new(
        channel: Channel,
        config: PresenceConfig,
        listener: Arc<dyn DiscoveryListener>,
        hasher: Arc<dyn PresenceHasher>,
    ) -> TransportResult<Arc<Self>> {
        let probe_from = Jid::parse(&config.probe_from).map_err(|e| {
            TransportError::InvalidConfig(format!("probe_from {:?}: {}", config.probe_from, e))
        })?;
        let cancel = CancellationToken::new();
        let state = PresenceState::new(
            channel.local_node(),
            config.timeout_ticks,
            config.reap_after_ticks,
            probe_from,
            cancel.child_token(),
        );
        let grtt = channel
            .sessions()
            .receiving
            .iter()
            .filter_map(|s| channel.engine().grtt_estimate(s.session))
            .max();

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            channel,
            state: Mutex::new(state),
            listener,
            hasher,
            config,
            grtt: Mutex::new(grtt),
            cancel,
        }))
    }

    /// Start the periodic snapshot broadcast.
    pub fn start(&self) {
        info!(
            node_id = %self.local_node(),
            interval_ms = self.tick_interval().as_millis() as u64,
            "Starting presence broadcast"
        );
        tokio::spawn(broadcast_loop(self.me.clone(), self.cancel.child_token()));
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn local_node(&self) -> NodeId {
        self.channel.local_node()
    }

    /// Copy of the local snapshot.
    pub fn local_snapshot(&self) -> PeerSnapshot {
        self.state.lock().local().clone()
    }

    /// Recorded view of a remote node.
    pub fn peer(&self, node: NodeId) -> Option<PeerSnapshot> {
        self.state.lock().peer(node).cloned()
    }

    /// Recorded views of every tracked remote node, by node id.
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        let state = self.state.lock();
        state
            .peer_ids()
            .into_iter()
            .filter_map(|id| state.peer(id).cloned())
            .collect()
    }

    /// Every known room.
    pub fn rooms(&self) -> Vec<Jid> {
        self.state.lock().rooms().map(|r| r.room.clone()).collect()
    }

    /// Remote occupants of a room.
    pub fn occupants(&self, room: &Jid) -> Vec<Occupant> {
        self.state
            .lock()
            .room(room)
            .map(|r| r.occupants.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Last presence received from a remote client.
    pub fn last_presence(&self, client: &Jid) -> Option<Stanza> {
        self.state.lock().last_presence(client).cloned()
    }

    /// Send occupant presence for `room` on its own channel from now on.
    pub fn register_room_channel(&self, room: Jid, channel: Arc<Channel>) {
        debug!(%room, channel = %channel.name(), "Room channel registered");
        self.state.lock().set_room_channel(room, channel);
    }

    /// Current liveness tick and broadcast period.
    pub fn tick_interval(&self) -> Duration {
        liveness::tick_interval(
            *self.grtt.lock(),
            self.config.grtt_multiplier,
            self.config.interval(),
        )
    }

    /// Bump the local sequence number and send the snapshot as a command.
    pub fn broadcast_snapshot(&self) -> TransportResult<()> {
        let snapshot = self.state.lock().next_broadcast();
        self.send_snapshot(&snapshot)
    }

    pub(super) fn send_snapshot(&self, snapshot: &PeerSnapshot) -> TransportResult<()> {
        trace!(node_id = %snapshot.node_id, seq = snapshot.seq, "Broadcasting snapshot");
        self.channel.send_command(WireCodec::encode_snapshot(snapshot)?)
    }

    /// Send a presence, on the room's channel when it addresses a room
    /// that has one.
    pub(super) fn send_presence(
        &self,
        presence: &Stanza,
        transport_type: TransportType,
        sub_type: TransportSubType,
    ) -> TransportResult<()> {
        let room_channel = presence
            .to
            .as_ref()
            .and_then(|to| self.state.lock().room_channel(&to.bare()));
        let xml = presence.to_xml();
        match room_channel {
            Some(channel) => channel.send(xml.as_bytes(), transport_type, sub_type),
            None => self.channel.send(xml.as_bytes(), transport_type, sub_type),
        }
    }

    pub(super) fn with_state<R>(&self, f: impl FnOnce(&mut PresenceState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// One liveness tick for `node`; returns true when its monitor is done.
    pub(super) fn liveness_tick(&self, node: NodeId) -> bool {
        let outcome = self.state.lock().tick(node);
        self.notify(outcome.events);
        outcome.finished
    }

    /// Carry out what a state change asked for. Must be called without the
    /// state lock held.
    fn apply(&self, effects: Effects) {
        if let Some((node, token)) = effects.new_monitor {
            if self.cancel.is_cancelled() {
                token.cancel();
            } else {
                tokio::spawn(monitor_loop(self.me.clone(), node, token));
            }
        }
        for probe in &effects.probes {
            debug!(to = ?probe.to, "Sending presence probe");
            if let Err(e) = self.channel.send(
                probe.to_xml().as_bytes(),
                TransportType::PresenceTransport,
                TransportSubType::Presence,
            ) {
                warn!(error = %e, "Probe send failed");
            }
        }
        self.notify(effects.events);
    }

    fn notify(&self, events: Vec<DiscoveryEvent>) {
        for event in events {
            debug!(%event, "Discovery event");
            event.deliver(self.listener.as_ref());
        }
    }

    fn handle_presence_probe(&self, session: SessionId, payload: &Bytes) {
        let snapshot = match WireCodec::decode_snapshot(payload) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(%session, error = %e, "Dropping malformed snapshot");
                return;
            }
        };
        trace!(node_id = %snapshot.node_id, seq = snapshot.seq, %session, "Snapshot received");
        let effects = self.state.lock().apply_snapshot(snapshot, Some(session));
        self.apply(effects);
    }

    fn handle_presence_transport_data(&self, node: NodeId, payload: &Bytes) {
        let Some(presence) = parse_presence(payload) else {
            return;
        };
        let hash = self.hasher.hash(&presence);
        let effects = self.state.lock().apply_presence(node, &presence, hash);
        self.apply(effects);
    }

    fn handle_muc_presence(&self, node: NodeId, payload: &Bytes) {
        let Some(presence) = parse_presence(payload) else {
            return;
        };
        let effects = self.state.lock().apply_muc_presence(node, &presence);
        self.apply(effects);
    }

    /// Route a room presence that arrived on a room's own channel.
    pub fn handle_room_presence(&self, sender: NodeId, metadata: &TransportMetadata, payload: &Bytes) {
        self.handle_muc_presence(metadata.orig_sender_id.unwrap_or(sender), payload);
    }
}

fn parse_presence(payload: &Bytes) -> Option<Stanza> {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Dropping non-UTF-8 presence");
            return None;
        }
    };
    match Stanza::from_xml(text) {
        Ok(stanza) if stanza.is_presence() => Some(stanza),
        Ok(stanza) => {
            warn!(kind = ?stanza.kind, "Non-presence on the presence channel, ignoring");
            None
        }
        Err(e) => {
            warn!(error = %e, "Dropping malformed presence");
            None
        }
    }
}

impl ChannelHandler for PresenceChannel {
    fn name(&self) -> &str {
        self.channel.name()
    }

    fn add_remote_node(&self, session: SessionId, node: NodeId) {
        let effects = self.state.lock().add_remote_node(node, session);
        self.apply(effects);
    }

    fn handle_transport_data(
        &self,
        sender: NodeId,
        session: SessionId,
        metadata: TransportMetadata,
        payload: Bytes,
    ) {
        if self.cancel.is_cancelled() || !self.channel.accept(session, &metadata, &payload) {
            return;
        }
        let origin = metadata.orig_sender_id.unwrap_or(sender);
        match metadata.transport_type.base() {
            TransportType::PresenceProbe => self.handle_presence_probe(session, &payload),
            TransportType::PresenceTransport => self.handle_presence_transport_data(origin, &payload),
            TransportType::MucPresence => self.handle_muc_presence(origin, &payload),
            other => {
                debug!(transport_type = ?other, node_id = %origin, "Ignoring payload on presence channel");
                return;
            }
        }
        self.channel.relay(session, &metadata, &payload);
    }

    fn update_grtt(&self, session: SessionId, grtt: Duration) {
        debug!(%session, grtt_ms = grtt.as_millis() as u64, "GRTT updated");
        *self.grtt.lock() = Some(grtt);
    }

    fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!(node_id = %self.local_node(), "Closing presence channel");
        self.cancel.cancel();
        self.state.lock().cancel_monitors();
        self.channel.shutdown_sessions();
    }
}
