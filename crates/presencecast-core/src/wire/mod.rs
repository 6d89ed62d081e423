//! Wire codec
//!
//! Objects travel as two independent byte strings: the JSON metadata
//! envelope (the engine's "info" slot) and the payload itself. When
//! compression is enabled both are zstd-compressed separately. Gossip
//! snapshots travel as engine commands and are always plain JSON.

pub mod compression;
pub mod metadata;

use bytes::Bytes;

use crate::error::TransportResult;
use crate::types::PeerSnapshot;

pub use metadata::{TransportMetadata, TransportSubType, TransportType};

/// Encodes and decodes envelopes and payloads for one channel
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec {
    compression: bool,
}

impl WireCodec {
    pub fn new(compression: bool) -> Self {
        Self { compression }
    }

    pub fn compression(&self) -> bool {
        self.compression
    }

    /// Encode an envelope for the engine's info slot.
    pub fn encode_metadata(&self, metadata: &TransportMetadata) -> TransportResult<Bytes> {
        let json = metadata.to_json_bytes()?;
        self.pack(json)
    }

    /// Decode an envelope. An empty info slot yields the default envelope.
    pub fn decode_metadata(&self, info: &[u8]) -> TransportResult<TransportMetadata> {
        if info.is_empty() {
            return Ok(TransportMetadata::default());
        }
        let json = self.unpack(info)?;
        TransportMetadata::from_json_bytes(&json)
    }

    pub fn encode_payload(&self, payload: &[u8]) -> TransportResult<Bytes> {
        self.pack(payload.to_vec())
    }

    pub fn decode_payload(&self, data: &[u8]) -> TransportResult<Bytes> {
        self.unpack(data)
    }

    /// Encode a gossip snapshot as a command body.
    pub fn encode_snapshot(snapshot: &PeerSnapshot) -> TransportResult<Bytes> {
        Ok(Bytes::from(snapshot.to_json()?))
    }

    pub fn decode_snapshot(data: &[u8]) -> TransportResult<PeerSnapshot> {
        PeerSnapshot::from_json(data)
    }

    fn pack(&self, data: Vec<u8>) -> TransportResult<Bytes> {
        if self.compression {
            let before = data.len();
            let packed = compression::compress(&data)?;
            tracing::trace!(before, after = packed.len(), "Compressed");
            Ok(Bytes::from(packed))
        } else {
            Ok(Bytes::from(data))
        }
    }

    fn unpack(&self, data: &[u8]) -> TransportResult<Bytes> {
        if self.compression {
            Ok(Bytes::from(compression::decompress(data)?))
        } else {
            Ok(Bytes::copy_from_slice(data))
        }
    }
}
