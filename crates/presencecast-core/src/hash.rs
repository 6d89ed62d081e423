//! Presence content hashing
//!
//! Snapshots carry a hash per client instead of the full presence, so a peer
//! only asks for the presence (a probe) when the hash changes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::types::Stanza;

/// Computes the content hash advertised for a client's presence
pub trait PresenceHasher: Send + Sync {
    fn hash(&self, presence: &Stanza) -> String;
}

/// BLAKE3 over the serialized presence, base64 encoded
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl PresenceHasher for Blake3Hasher {
    fn hash(&self, presence: &Stanza) -> String {
        let digest = blake3::hash(presence.to_xml().as_bytes());
        STANDARD.encode(digest.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Jid;

    #[test]
    fn test_hash_tracks_content() {
        let from = Jid::parse("user1@proxy").unwrap();
        let a = Stanza::presence().with_from(from.clone()).with_status("here");
        let b = Stanza::presence().with_from(from).with_status("away");

        let hasher = Blake3Hasher;
        assert_eq!(hasher.hash(&a), hasher.hash(&a.clone()));
        assert_ne!(hasher.hash(&a), hasher.hash(&b));
        // 32 digest bytes -> 44 base64 characters
        assert_eq!(hasher.hash(&a).len(), 44);
    }
}
