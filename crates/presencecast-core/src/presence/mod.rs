//! Presence gossip over the presence channel
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  PresenceChannel                                             │
//! │  ├── Channel (first port of the range)                       │
//! │  ├── PresenceState (one mutex)                               │
//! │  │   ├── local PeerSnapshot                                  │
//! │  │   ├── remote peers + seq records + monitor tokens         │
//! │  │   └── rooms, occupants, last presences                    │
//! │  ├── broadcast task (local snapshot as engine command)       │
//! │  └── liveness monitor per remote node                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each node broadcasts its full snapshot periodically. Receivers diff it
//! against what they recorded, probe identities whose presence hash changed,
//! and report discoveries, removals and room membership changes to the
//! [`DiscoveryListener`](crate::discovery::DiscoveryListener). Full presences
//! travel separately as presence transport payloads.

mod channel;
pub mod liveness;
mod manager;
pub mod state;

pub use channel::PresenceChannel;
pub use liveness::tick_interval;
pub use state::{Effects, PresenceState, TickOutcome, RECONNECTED_PREFIX};
