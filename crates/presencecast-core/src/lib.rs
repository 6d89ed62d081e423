//! Presencecast Core Library
//!
//! Presence gossip and redirecting multicast channels for federating chat
//! proxies over a reliable-multicast engine.
//!
//! ## Overview
//!
//! Every proxy instance (a node) periodically multicasts a snapshot of its
//! local clients, their presence hashes and room memberships. Peers diff
//! those snapshots, probe for presences whose hash changed, track liveness,
//! and report changes to the proxy through a [`DiscoveryListener`]. Chat and
//! IQ traffic travels on per-room and one-to-one [`Channel`]s, relayed across
//! every configured interface with duplicate suppression.
//!
//! ## Core Principles
//!
//! - **Engine-agnostic**: delivery is behind [`MulticastEngine`]; an
//!   in-process engine backs tests, a UDP engine backs the CLI
//! - **Gossip, not request/response**: full state is re-sent every interval
//! - **Deterministic ports**: every node maps a channel name to the same port
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use presencecast_core::{
//!     DiscoveryManager, EventForwarder, Jid, PacketForwarder, Stanza,
//!     TransportConfig, TransportService, UdpEngine,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TransportConfig::default();
//!     let events = EventForwarder::new();
//!     let mut rx = events.subscribe();
//!
//!     let service = TransportService::new(
//!         config,
//!         Arc::new(UdpEngine::new(std::time::Duration::from_secs(1))),
//!         Arc::new(events),
//!         Arc::new(PacketForwarder::new()),
//!     )?;
//!     let _event_loop = service.start()?;
//!
//!     service
//!         .presence()
//!         .advertise_client(&Stanza::presence().with_from(Jid::parse("me@proxy")?))?;
//!
//!     while let Ok(event) = rx.recv().await {
//!         println!("{}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod hash;
pub mod logging;
pub mod presence;
pub mod service;
pub mod transport;
pub mod types;
pub mod wire;

// Re-exports
pub use config::{EngineParams, PresenceConfig, TransportConfig};
pub use discovery::{
    DiscoveryEvent, DiscoveryListener, DiscoveryManager, EventForwarder, PacketForwarder,
    PacketSink, ReceivedPacket,
};
pub use engine::{EngineEvent, MemoryEngine, MemoryNetwork, MulticastEngine, UdpEngine};
pub use error::{TransportError, TransportResult};
pub use hash::{Blake3Hasher, PresenceHasher};
pub use presence::PresenceChannel;
pub use service::TransportService;
pub use transport::{Channel, ChannelHandler, PortRange};
pub use types::{Jid, NodeId, Occupant, PeerSnapshot, PresenceType, SessionId, Stanza, StanzaKind};
pub use wire::{TransportMetadata, TransportSubType, TransportType, WireCodec};
