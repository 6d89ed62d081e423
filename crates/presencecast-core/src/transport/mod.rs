//! Redirecting multicast channels
//!
//! A [`Channel`] is one logical duplex channel (the one-to-one chat channel,
//! a room, or the presence channel underneath the gossip layer) bound to one
//! engine session per physical interface. It owns sending on every
//! interface, duplicate suppression, relaying onto the other interfaces and
//! late-delivery marking.
//!
//! The coordinator routes engine events to channels through the
//! [`ChannelHandler`] trait, which the presence layer also implements.

mod channel;
pub mod dedup;
pub mod ports;

use std::time::Duration;

use bytes::Bytes;

use crate::types::{NodeId, SessionId};
use crate::wire::TransportMetadata;

pub use channel::{Channel, ChannelOptions, ChannelSession, ChannelSessions};
pub use dedup::DuplicateCache;
pub use ports::{stable_hash, PortRange, ONE_TO_ONE_CHANNEL};

/// Receive-side entry points the coordinator calls for a channel's sessions
pub trait ChannelHandler: Send + Sync {
    /// Logical name, used for logging
    fn name(&self) -> &str;

    /// The engine reported traffic from a sender not seen before.
    fn add_remote_node(&self, session: SessionId, node: NodeId);

    /// A decoded object arrived on one of the channel's sessions.
    fn handle_transport_data(
        &self,
        sender: NodeId,
        session: SessionId,
        metadata: TransportMetadata,
        payload: Bytes,
    );

    /// The round-trip estimate of one of the channel's sessions changed.
    fn update_grtt(&self, _session: SessionId, _grtt: Duration) {}

    /// Stop every session; calling it again does nothing.
    fn close(&self);
}
