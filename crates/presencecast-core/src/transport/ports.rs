//! Deterministic port allocation
//!
//! Every proxy must pick the same port for the same logical channel without
//! coordination, so ports are derived from a stable hash of the channel name
//! (`room@conference.proxy`, `oneToOne@oneToOne`) folded into the configured
//! range. The presence channel always takes the first port.

use std::fmt;
use std::str::FromStr;

use crate::error::TransportError;

/// Logical name of the one-to-one chat channel
pub const ONE_TO_ONE_CHANNEL: &str = "oneToOne@oneToOne";

/// Inclusive range of UDP ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, TransportError> {
        if start == 0 || end < start {
            return Err(TransportError::InvalidPortRange(format!("{}-{}", start, end)));
        }
        Ok(Self { start, end })
    }

    /// Port of the presence channel
    pub fn first(&self) -> u16 {
        self.start
    }

    pub fn last(&self) -> u16 {
        self.end
    }

    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Always false; a range holds at least one port.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Port for the channel called `name`.
    pub fn port_for(&self, name: &str) -> u16 {
        let offset = stable_hash(name) % self.len() as u64;
        self.start + offset as u16
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = TransportError;

    /// Parse `"start-end"` or a single port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidPortRange(s.to_string());
        let (start, end) = match s.trim().split_once('-') {
            Some((start, end)) => (start.trim(), end.trim()),
            None => (s.trim(), s.trim()),
        };
        let start: u16 = start.parse().map_err(|_| invalid())?;
        let end: u16 = end.parse().map_err(|_| invalid())?;
        PortRange::new(start, end).map_err(|_| invalid())
    }
}

/// Platform-independent 64-bit hash of a channel name
pub fn stable_hash(name: &str) -> u64 {
    let digest = blake3::hash(name.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse() {
        let range: PortRange = "10001-10010".parse().unwrap();
        assert_eq!(range.first(), 10001);
        assert_eq!(range.last(), 10010);
        assert_eq!(range.len(), 10);
        assert_eq!(range.to_string(), "10001-10010");

        let single: PortRange = "10001".parse().unwrap();
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn test_parse_rejects() {
        for bad in ["", "abc", "10010-10001", "0-5", "1-2-3", "70000"] {
            assert!(
                matches!(bad.parse::<PortRange>(), Err(TransportError::InvalidPortRange(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_single_port_range_maps_everything_to_it() {
        let range: PortRange = "10001-10001".parse().unwrap();
        assert_eq!(range.port_for("room@conference.proxy"), 10001);
        assert_eq!(range.port_for(ONE_TO_ONE_CHANNEL), 10001);
    }

    #[test]
    fn test_hash_is_stable() {
        // Pinned values: every node, on every build, must agree on them
        assert_eq!(stable_hash("room@conference.proxy"), 3182528198186486572);
        assert_eq!(stable_hash(ONE_TO_ONE_CHANNEL), 7979482347023703375);

        let range: PortRange = "10001-10020".parse().unwrap();
        assert_eq!(range.port_for("room@conference.proxy"), 10013);
        assert_eq!(range.port_for(ONE_TO_ONE_CHANNEL), 10016);

        let range: PortRange = "20000-20099".parse().unwrap();
        assert_eq!(range.port_for("room@conference.proxy"), 20072);
    }

    proptest! {
        #[test]
        fn prop_port_within_range(start in 1u16..60000, width in 0u16..5000, name in "[a-z]{1,12}@[a-z.]{1,16}") {
            let range = PortRange::new(start, start + width).unwrap();
            let port = range.port_for(&name);
            prop_assert!(range.contains(port));
            prop_assert_eq!(port, range.port_for(&name));
        }
    }
}
