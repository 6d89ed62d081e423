//! Discovery notifications and collaborator seams
//!
//! The transport talks to the rest of the proxy through three traits:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  DiscoveryManager (implemented by PresenceChannel)              │
//! │  └── local publishes: advertise/remove/update client, occupant, │
//! │      room                                                       │
//! │                                                                 │
//! │  DiscoveryListener (implemented by the proxy)                   │
//! │  ├── client discovered / updated / removed                      │
//! │  ├── client disconnected / reconnected                          │
//! │  ├── room added / removed                                       │
//! │  └── occupant joined / exited / updated                         │
//! │                                                                 │
//! │  PacketSink (implemented by the proxy)                          │
//! │  └── chat and IQ packets received from remote nodes             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`EventForwarder`] and [`PacketForwarder`] adapt the listener and sink
//! traits onto tokio broadcast channels for consumers that prefer a stream.

use std::fmt;

use tokio::sync::broadcast;

use crate::error::TransportResult;
use crate::types::{Jid, Stanza};

/// Buffer size for the broadcast channels
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Receives discovery notifications.
///
/// Calls are made after the presence state lock is released, so an
/// implementation may call back into the [`DiscoveryManager`].
pub trait DiscoveryListener: Send + Sync {
    fn client_discovered(&self, presence: &Stanza);
    fn client_updated(&self, presence: &Stanza);
    /// `presence` is an unavailable presence from the removed client
    fn client_removed(&self, presence: &Stanza);
    fn client_disconnected(&self, jid: &Jid);
    fn client_reconnected(&self, presence: &Stanza);
    fn room_added(&self, room: &Jid);
    fn room_removed(&self, room: &Jid);
    fn occupant_joined(&self, presence: &Stanza);
    fn occupant_exited(&self, presence: &Stanza);
    fn occupant_updated(&self, presence: &Stanza);
}

/// Receives chat and IQ packets from remote nodes
pub trait PacketSink: Send + Sync {
    fn process_packet(&self, from: Option<&Jid>, packet: &Stanza);
}

/// Local publish operations of the presence subsystem
pub trait DiscoveryManager: Send + Sync {
    fn advertise_client(&self, presence: &Stanza) -> TransportResult<()>;
    fn remove_client(&self, presence: &Stanza) -> TransportResult<()>;
    fn update_client_status(&self, presence: &Stanza) -> TransportResult<()>;
    fn advertise_muc_occupant(&self, presence: &Stanza) -> TransportResult<()>;
    fn remove_muc_occupant(&self, presence: &Stanza) -> TransportResult<()>;
    fn update_muc_occupant_status(&self, presence: &Stanza) -> TransportResult<()>;
    fn advertise_muc_room(&self, room: &Jid) -> TransportResult<()>;
}

/// A discovery notification as a value
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    ClientDiscovered(Stanza),
    ClientUpdated(Stanza),
    ClientRemoved(Stanza),
    ClientDisconnected(Jid),
    ClientReconnected(Stanza),
    RoomAdded(Jid),
    RoomRemoved(Jid),
    OccupantJoined(Stanza),
    OccupantExited(Stanza),
    OccupantUpdated(Stanza),
}

impl DiscoveryEvent {
    /// Invoke the matching listener method.
    pub fn deliver(&self, listener: &dyn DiscoveryListener) {
        match self {
            DiscoveryEvent::ClientDiscovered(p) => listener.client_discovered(p),
            DiscoveryEvent::ClientUpdated(p) => listener.client_updated(p),
            DiscoveryEvent::ClientRemoved(p) => listener.client_removed(p),
            DiscoveryEvent::ClientDisconnected(jid) => listener.client_disconnected(jid),
            DiscoveryEvent::ClientReconnected(p) => listener.client_reconnected(p),
            DiscoveryEvent::RoomAdded(room) => listener.room_added(room),
            DiscoveryEvent::RoomRemoved(room) => listener.room_removed(room),
            DiscoveryEvent::OccupantJoined(p) => listener.occupant_joined(p),
            DiscoveryEvent::OccupantExited(p) => listener.occupant_exited(p),
            DiscoveryEvent::OccupantUpdated(p) => listener.occupant_updated(p),
        }
    }

    /// The client, room or occupant the event is about.
    pub fn subject(&self) -> Option<&Jid> {
        match self {
            DiscoveryEvent::ClientDisconnected(jid)
            | DiscoveryEvent::RoomAdded(jid)
            | DiscoveryEvent::RoomRemoved(jid) => Some(jid),
            DiscoveryEvent::ClientDiscovered(p)
            | DiscoveryEvent::ClientUpdated(p)
            | DiscoveryEvent::ClientRemoved(p)
            | DiscoveryEvent::ClientReconnected(p) => p.from.as_ref(),
            DiscoveryEvent::OccupantJoined(p)
            | DiscoveryEvent::OccupantExited(p)
            | DiscoveryEvent::OccupantUpdated(p) => p.to.as_ref(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            DiscoveryEvent::ClientDiscovered(_) => "client discovered",
            DiscoveryEvent::ClientUpdated(_) => "client updated",
            DiscoveryEvent::ClientRemoved(_) => "client removed",
            DiscoveryEvent::ClientDisconnected(_) => "client disconnected",
            DiscoveryEvent::ClientReconnected(_) => "client reconnected",
            DiscoveryEvent::RoomAdded(_) => "room added",
            DiscoveryEvent::RoomRemoved(_) => "room removed",
            DiscoveryEvent::OccupantJoined(_) => "occupant joined",
            DiscoveryEvent::OccupantExited(_) => "occupant exited",
            DiscoveryEvent::OccupantUpdated(_) => "occupant updated",
        }
    }
}

impl fmt::Display for DiscoveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subject() {
            Some(jid) => write!(f, "{}: {}", self.label(), jid),
            None => write!(f, "{}", self.label()),
        }
    }
}

/// Publishes every listener callback as a [`DiscoveryEvent`].
#[derive(Debug, Clone)]
pub struct EventForwarder {
    tx: broadcast::Sender<DiscoveryEvent>,
}

impl EventForwarder {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: DiscoveryEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryListener for EventForwarder {
    fn client_discovered(&self, presence: &Stanza) {
        self.publish(DiscoveryEvent::ClientDiscovered(presence.clone()));
    }

    fn client_updated(&self, presence: &Stanza) {
        self.publish(DiscoveryEvent::ClientUpdated(presence.clone()));
    }

    fn client_removed(&self, presence: &Stanza) {
        self.publish(DiscoveryEvent::ClientRemoved(presence.clone()));
    }

    fn client_disconnected(&self, jid: &Jid) {
        self.publish(DiscoveryEvent::ClientDisconnected(jid.clone()));
    }

    fn client_reconnected(&self, presence: &Stanza) {
        self.publish(DiscoveryEvent::ClientReconnected(presence.clone()));
    }

    fn room_added(&self, room: &Jid) {
        self.publish(DiscoveryEvent::RoomAdded(room.clone()));
    }

    fn room_removed(&self, room: &Jid) {
        self.publish(DiscoveryEvent::RoomRemoved(room.clone()));
    }

    fn occupant_joined(&self, presence: &Stanza) {
        self.publish(DiscoveryEvent::OccupantJoined(presence.clone()));
    }

    fn occupant_exited(&self, presence: &Stanza) {
        self.publish(DiscoveryEvent::OccupantExited(presence.clone()));
    }

    fn occupant_updated(&self, presence: &Stanza) {
        self.publish(DiscoveryEvent::OccupantUpdated(presence.clone()));
    }
}

/// A packet handed to a [`PacketSink`]
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedPacket {
    pub from: Option<Jid>,
    pub packet: Stanza,
}

/// Publishes every received packet on a broadcast channel.
#[derive(Debug, Clone)]
pub struct PacketForwarder {
    tx: broadcast::Sender<ReceivedPacket>,
}

impl PacketForwarder {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReceivedPacket> {
        self.tx.subscribe()
    }
}

impl Default for PacketForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSink for PacketForwarder {
    fn process_packet(&self, from: Option<&Jid>, packet: &Stanza) {
        let _ = self.tx.send(ReceivedPacket {
            from: from.cloned(),
            packet: packet.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_forwarder_publishes_events() {
        let forwarder = EventForwarder::new();
        let mut rx = forwarder.subscribe();

        let presence = Stanza::presence().with_from(jid("user1@proxy"));
        DiscoveryEvent::ClientDiscovered(presence.clone()).deliver(&forwarder);
        forwarder.room_added(&jid("room@conference.proxy"));

        assert_eq!(rx.recv().await.unwrap(), DiscoveryEvent::ClientDiscovered(presence));
        assert_eq!(
            rx.recv().await.unwrap(),
            DiscoveryEvent::RoomAdded(jid("room@conference.proxy"))
        );
    }

    #[test]
    fn test_publish_without_subscribers() {
        let forwarder = EventForwarder::new();
        forwarder.client_disconnected(&jid("user1@proxy"));
    }

    #[test]
    fn test_display() {
        let event = DiscoveryEvent::OccupantJoined(
            Stanza::presence()
                .with_from(jid("user1@proxy"))
                .with_to(jid("room@conference.proxy/user1")),
        );
        assert_eq!(event.to_string(), "occupant joined: room@conference.proxy/user1");
    }

    #[tokio::test]
    async fn test_packet_forwarder() {
        let forwarder = PacketForwarder::new();
        let mut rx = forwarder.subscribe();
        let msg = Stanza::new(crate::types::StanzaKind::Message).with_body("hi");
        forwarder.process_packet(Some(&jid("a@proxy")), &msg);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.from, Some(jid("a@proxy")));
        assert_eq!(received.packet.body.as_deref(), Some("hi"));
    }
}
