//! Optional payload compression (zstd)

use std::io::Read;

use crate::error::{TransportError, TransportResult};

const LEVEL: i32 = 3;

/// Largest payload a received frame may inflate to
pub const MAX_DECOMPRESSED_LEN: usize = 1 << 20;

pub fn compress(data: &[u8]) -> TransportResult<Vec<u8>> {
    zstd::encode_all(data, LEVEL).map_err(|e| TransportError::Compression(e.to_string()))
}

pub fn decompress(data: &[u8]) -> TransportResult<Vec<u8>> {
    decompress_bounded(data, MAX_DECOMPRESSED_LEN)
}

/// Decompress, failing once the output would exceed `limit` bytes.
pub fn decompress_bounded(data: &[u8], limit: usize) -> TransportResult<Vec<u8>> {
    let decoder = zstd::stream::read::Decoder::new(data)
        .map_err(|e| TransportError::Compression(e.to_string()))?;
    let mut out = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| TransportError::Compression(e.to_string()))?;
    if out.len() > limit {
        return Err(TransportError::Compression(format!(
            "decompressed payload exceeds {} bytes",
            limit
        )));
    }
    Ok(out)
}
