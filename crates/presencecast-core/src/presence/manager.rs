//! Local publish operations

use tracing::debug;

use super::PresenceChannel;
use crate::discovery::DiscoveryManager;
use crate::error::TransportResult;
use crate::types::{Jid, PresenceType, Stanza};
use crate::wire::{TransportSubType, TransportType};

impl PresenceChannel {
    fn publish_client(&self, presence: &Stanza) -> TransportResult<()> {
        let hash = self.hasher.hash(presence);
        self.with_state(|state| state.apply_local_presence(presence, hash));
        debug!(from = ?presence.from, presence_type = ?presence.presence_type(), "Publishing client presence");
        self.send_presence(
            presence,
            TransportType::PresenceTransport,
            TransportSubType::Presence,
        )
    }

    fn publish_occupant(&self, presence: &Stanza) -> TransportResult<()> {
        self.with_state(|state| state.apply_local_occupant(presence));
        debug!(from = ?presence.from, to = ?presence.to, "Publishing room presence");
        self.send_presence(presence, TransportType::MucPresence, TransportSubType::MucPresence)
    }
}

/// Force the presence to unavailable.
fn as_unavailable(presence: &Stanza) -> Stanza {
    if presence.presence_type() == PresenceType::Unavailable {
        return presence.clone();
    }
    presence.clone().with_type("unavailable")
}

impl DiscoveryManager for PresenceChannel {
    fn advertise_client(&self, presence: &Stanza) -> TransportResult<()> {
        self.publish_client(presence)
    }

    fn remove_client(&self, presence: &Stanza) -> TransportResult<()> {
        self.publish_client(&as_unavailable(presence))
    }

    fn update_client_status(&self, presence: &Stanza) -> TransportResult<()> {
        self.publish_client(presence)
    }

    fn advertise_muc_occupant(&self, presence: &Stanza) -> TransportResult<()> {
        self.publish_occupant(presence)
    }

    fn remove_muc_occupant(&self, presence: &Stanza) -> TransportResult<()> {
        self.publish_occupant(&as_unavailable(presence))
    }

    fn update_muc_occupant_status(&self, presence: &Stanza) -> TransportResult<()> {
        self.publish_occupant(presence)
    }

    /// Advertise a room and broadcast the snapshot right away.
    fn advertise_muc_room(&self, room: &Jid) -> TransportResult<()> {
        let snapshot = self.with_state(|state| state.add_local_room(room.clone()));
        debug!(%room, seq = snapshot.seq, "Advertising room");
        self.send_snapshot(&snapshot)
    }
}
