//! Transport metadata envelope
//!
//! Every object enqueued on an engine session carries a small JSON envelope
//! in the engine's "info" slot:
//!
//! ```json
//! {"timestamp": 1700000000000, "transportType": "PresenceTransport",
//!  "transportSubType": "Presence", "origSenderId": 7}
//! ```
//!
//! `origSenderId` names the node that first produced the payload and is kept
//! unchanged when another node relays it onto a different interface. Missing
//! fields decode as `0`, `Unknown`, `Unknown` and `-1` (no origin).

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TransportResult;
use crate::types::NodeId;

/// Logical category of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransportType {
    Control,
    PresenceInit,
    PresenceInitRedirect,
    PresenceTransport,
    PresenceTransportRedirect,
    PresenceProbe,
    PresenceProbeRedirect,
    #[serde(rename = "MUCPresence")]
    MucPresence,
    #[serde(rename = "MUCPresenceRedirect")]
    MucPresenceRedirect,
    OneToOneTransport,
    MessageTransport,
    MessageTransportRedirect,
    #[serde(rename = "IQTransport")]
    IqTransport,
    #[default]
    #[serde(other)]
    Unknown,
}

impl TransportType {
    /// Whether this category marks a relayed copy.
    pub fn is_redirect(self) -> bool {
        matches!(
            self,
            TransportType::PresenceInitRedirect
                | TransportType::PresenceTransportRedirect
                | TransportType::PresenceProbeRedirect
                | TransportType::MucPresenceRedirect
                | TransportType::MessageTransportRedirect
        )
    }

    /// The category a relayed copy of this payload is tagged with.
    ///
    /// Chat and IQ traffic share `MessageTransportRedirect`.
    pub fn redirected(self) -> TransportType {
        match self {
            TransportType::PresenceInit | TransportType::PresenceInitRedirect => {
                TransportType::PresenceInitRedirect
            }
            TransportType::PresenceTransport | TransportType::PresenceTransportRedirect => {
                TransportType::PresenceTransportRedirect
            }
            TransportType::PresenceProbe | TransportType::PresenceProbeRedirect => {
                TransportType::PresenceProbeRedirect
            }
            TransportType::MucPresence | TransportType::MucPresenceRedirect => {
                TransportType::MucPresenceRedirect
            }
            _ => TransportType::MessageTransportRedirect,
        }
    }

    /// The category with any redirect marker stripped.
    pub fn base(self) -> TransportType {
        match self {
            TransportType::PresenceInitRedirect => TransportType::PresenceInit,
            TransportType::PresenceTransportRedirect => TransportType::PresenceTransport,
            TransportType::PresenceProbeRedirect => TransportType::PresenceProbe,
            TransportType::MucPresenceRedirect => TransportType::MucPresence,
            TransportType::MessageTransportRedirect => TransportType::MessageTransport,
            other => other,
        }
    }
}

/// Sub-category of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransportSubType {
    Initialization,
    Redirect,
    #[serde(rename = "JSON")]
    Json,
    Presence,
    #[serde(rename = "MUCPresence")]
    MucPresence,
    Chat,
    GroupChat,
    #[serde(rename = "IQ")]
    Iq,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Envelope attached to every transported object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMetadata {
    /// Milliseconds since the Unix epoch when the payload was produced
    #[serde(default)]
    pub timestamp: i64,

    #[serde(rename = "transportType", default)]
    pub transport_type: TransportType,

    #[serde(rename = "transportSubType", default)]
    pub transport_sub_type: TransportSubType,

    #[serde(rename = "origSenderId", default, with = "orig_sender")]
    pub orig_sender_id: Option<NodeId>,
}

impl Default for TransportMetadata {
    fn default() -> Self {
        Self {
            timestamp: 0,
            transport_type: TransportType::Unknown,
            transport_sub_type: TransportSubType::Unknown,
            orig_sender_id: None,
        }
    }
}

impl TransportMetadata {
    /// Stamp a new envelope with the current time.
    pub fn now(
        transport_type: TransportType,
        transport_sub_type: TransportSubType,
        orig_sender_id: Option<NodeId>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            transport_type,
            transport_sub_type,
            orig_sender_id,
        }
    }

    /// Whether the payload is a relayed copy.
    pub fn is_redirect(&self) -> bool {
        self.transport_type.is_redirect()
    }

    /// The envelope for relaying this payload onto another interface.
    ///
    /// Timestamp and origin are preserved.
    pub fn redirected(&self) -> Self {
        Self {
            transport_type: self.transport_type.redirected(),
            ..*self
        }
    }

    /// Age of the payload relative to `now_ms`, never negative.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.timestamp).max(0)
    }

    pub fn to_json_bytes(&self) -> TransportResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> TransportResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// `origSenderId` travels as a signed number with `-1` meaning "none".
mod orig_sender {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<NodeId>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(id) => s.serialize_i64(id.get() as i64),
            None => s.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NodeId>, D::Error> {
        let raw = i64::deserialize(d)?;
        Ok((raw >= 0).then_some(NodeId(raw as u64)))
    }
}
