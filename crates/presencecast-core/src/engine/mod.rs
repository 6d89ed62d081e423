//! Multicast delivery engine abstraction
//!
//! The transport does not implement reliable multicast itself. It drives an
//! engine that offers sessions (one per interface, group and port) able to
//! deliver whole objects and small out-of-band commands to every receiver in
//! the group, and that reports what happened through a single event stream.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  MulticastEngine                                             │
//! │  ├── create_session(iface, group, port, node)  -> SessionId  │
//! │  ├── start_sender / start_receiver / stop_*                  │
//! │  ├── data_enqueue(session, data, info)   object + envelope   │
//! │  ├── send_command(session, bytes)        gossip snapshot     │
//! │  ├── grtt_estimate(session)                                  │
//! │  └── next_event()  -> EngineEvent                            │
//! │                                                              │
//! │  Implementations                                             │
//! │  ├── MemoryEngine: in-process links for tests and demos      │
//! │  └── UdpEngine: best-effort IPv4 multicast datagrams         │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod memory;
pub mod udp;

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::config::EngineParams;
use crate::error::TransportResult;
use crate::types::{NodeId, SessionId};

pub use memory::{MemoryEngine, MemoryNetwork};
pub use udp::UdpEngine;

/// Something the engine observed on one of its sessions
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// First traffic from a remote sender on this session
    RemoteSenderNew { session: SessionId, sender: NodeId },
    /// A remote sender has gone quiet
    RemoteSenderInactive { session: SessionId, sender: NodeId },
    /// A whole object arrived
    RxObjectCompleted {
        session: SessionId,
        sender: NodeId,
        info: Bytes,
        data: Bytes,
    },
    /// An out-of-band command arrived
    RxCommandNew {
        session: SessionId,
        sender: NodeId,
        command: Bytes,
    },
    /// The group round-trip estimate of a session changed
    GrttUpdated { session: SessionId, grtt: Duration },
    /// Everything enqueued on a session has been sent
    TxQueueEmpty { session: SessionId },
}

impl EngineEvent {
    pub fn session(&self) -> SessionId {
        match self {
            EngineEvent::RemoteSenderNew { session, .. }
            | EngineEvent::RemoteSenderInactive { session, .. }
            | EngineEvent::RxObjectCompleted { session, .. }
            | EngineEvent::RxCommandNew { session, .. }
            | EngineEvent::GrttUpdated { session, .. }
            | EngineEvent::TxQueueEmpty { session } => *session,
        }
    }
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::RemoteSenderNew { session, sender } => {
                write!(f, "remote sender new {} on {}", sender, session)
            }
            EngineEvent::RemoteSenderInactive { session, sender } => {
                write!(f, "remote sender inactive {} on {}", sender, session)
            }
            EngineEvent::RxObjectCompleted { session, sender, data, .. } => {
                write!(f, "object from {} on {} ({} bytes)", sender, session, data.len())
            }
            EngineEvent::RxCommandNew { session, sender, command } => {
                write!(f, "command from {} on {} ({} bytes)", sender, session, command.len())
            }
            EngineEvent::GrttUpdated { session, grtt } => {
                write!(f, "grtt {:?} on {}", grtt, session)
            }
            EngineEvent::TxQueueEmpty { session } => write!(f, "tx queue empty on {}", session),
        }
    }
}

/// A session-oriented multicast object delivery engine.
///
/// Methods other than [`next_event`](Self::next_event) must not block.
pub trait MulticastEngine: Send + Sync {
    /// Create a session on `iface` for `group:port`, sending as `local_node`.
    fn create_session(
        &self,
        iface: &str,
        group: Ipv4Addr,
        port: u16,
        local_node: NodeId,
    ) -> TransportResult<SessionId>;

    fn start_sender(&self, session: SessionId, params: &EngineParams) -> TransportResult<()>;

    fn start_receiver(&self, session: SessionId, params: &EngineParams) -> TransportResult<()>;

    fn stop_sender(&self, session: SessionId);

    fn stop_receiver(&self, session: SessionId);

    /// Enqueue an object; `info` travels alongside it.
    fn data_enqueue(&self, session: SessionId, data: Bytes, info: Bytes) -> TransportResult<()>;

    fn send_command(&self, session: SessionId, command: Bytes) -> TransportResult<()>;

    /// Current group round-trip estimate, if the engine has one.
    fn grtt_estimate(&self, session: SessionId) -> Option<Duration>;

    /// Node id the session sends as.
    fn local_node_id(&self, session: SessionId) -> Option<NodeId>;

    /// Wait for the next event.
    ///
    /// `Ok(None)` means the engine was shut down; `Err` means it failed and
    /// no further events will arrive.
    fn next_event(&self) -> BoxFuture<'_, TransportResult<Option<EngineEvent>>>;

    /// Stop every session and end the event stream.
    fn shutdown(&self);
}
