//! Duplicate payload suppression
//!
//! The same payload can reach a node once per receiving interface, and a
//! node's own payloads can come back to it through a relay. Each payload is
//! counted until it has been seen once per receiving interface, then
//! forgotten.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

struct Entry {
    hits: usize,
    /// Insertion stamp matching the entry's slot in `order`
    stamp: u64,
}

/// Bounded payload -> hit counter
pub struct DuplicateCache {
    entries: HashMap<Bytes, Entry>,
    order: VecDeque<(u64, Bytes)>,
    capacity: usize,
    next_stamp: u64,
}

impl DuplicateCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            next_stamp: 0,
        }
    }

    /// Record a sighting and report whether the payload was seen before.
    ///
    /// `copies` is the number of receiving interfaces, i.e. how many times
    /// the payload is expected to arrive. The entry is dropped once its
    /// count reaches `copies`.
    pub fn check(&mut self, payload: &Bytes, copies: usize) -> bool {
        if let Some(entry) = self.entries.get_mut(payload) {
            entry.hits += 1;
            if entry.hits >= copies {
                self.entries.remove(payload);
            }
            return true;
        }
        if copies > 1 {
            self.insert(payload.clone());
        }
        false
    }

    /// Mark a payload this node is sending so its relayed echo is absorbed.
    pub fn register_sent(&mut self, payload: &Bytes) {
        if !self.entries.contains_key(payload) {
            self.insert(payload.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, payload: &[u8]) -> bool {
        self.entries.contains_key(payload)
    }

    fn insert(&mut self, payload: Bytes) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.entries.insert(payload.clone(), Entry { hits: 1, stamp });
        self.order.push_back((stamp, payload));

        while self.entries.len() > self.capacity {
            let Some((stamp, oldest)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&oldest).is_some_and(|e| e.stamp == stamp) {
                self.entries.remove(&oldest);
            }
        }
        // Stale slots left behind by entries evicted through `check`
        if self.order.len() > self.capacity * 2 {
            let entries = &self.entries;
            self.order
                .retain(|(stamp, payload)| entries.get(payload).is_some_and(|e| e.stamp == *stamp));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_processed_once_over_n_interfaces() {
        let mut cache = DuplicateCache::new(16);
        let p = payload("<message/>");

        assert!(!cache.check(&p, 3));
        assert!(cache.check(&p, 3));
        assert!(cache.contains(&p));
        assert!(cache.check(&p, 3));
        // Evicted after the third sighting
        assert!(!cache.contains(&p));
        assert!(!cache.check(&p, 3));
    }

    #[test]
    fn test_single_interface_keeps_nothing() {
        let mut cache = DuplicateCache::new(16);
        let p = payload("<message/>");
        assert!(!cache.check(&p, 1));
        assert!(!cache.check(&p, 1));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_own_payload_echo_absorbed() {
        let mut cache = DuplicateCache::new(16);
        let p = payload("{\"mine\":true}");
        cache.register_sent(&p);
        assert!(cache.check(&p, 1));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = DuplicateCache::new(2);
        let (a, b, c) = (payload("a"), payload("b"), payload("c"));
        cache.register_sent(&a);
        cache.register_sent(&b);
        cache.register_sent(&c);

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&a));
        assert!(cache.contains(&b));
        assert!(cache.contains(&c));
    }

    #[test]
    fn test_reinserted_payload_not_evicted_by_stale_slot() {
        let mut cache = DuplicateCache::new(2);
        let (a, b, c) = (payload("a"), payload("b"), payload("c"));
        assert!(!cache.check(&a, 2));
        assert!(cache.check(&a, 2)); // evicted, stale slot remains
        cache.register_sent(&b);
        cache.register_sent(&a);
        cache.register_sent(&c);

        assert!(!cache.contains(&b));
        assert!(cache.contains(&a));
        assert!(cache.contains(&c));
    }
}
