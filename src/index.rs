//! Bidirectional topic string ↔ numeric id registry.
//!
//! Ids stand in for full topic strings on the datagram wire. `0` is
//! reserved and means "unassigned"; entries are never removed.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Topic id registry with monotonic allocation.
pub struct TopicIndex {
    inner: RwLock<Inner>,
}

struct Inner {
    by_topic: HashMap<String, u16>,
    by_id: HashMap<u16, String>,
    next: u16,
}

impl Default for TopicIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_topic: HashMap::new(),
                by_id: HashMap::new(),
                next: 0,
            }),
        }
    }

    /// Return the id bound to `topic`, allocating the next free id if the
    /// topic has never been seen.
    pub fn get_or_assign(&self, topic: &str) -> Result<u16> {
        let mut inner = self.inner.write();
        if let Some(&id) = inner.by_topic.get(topic) {
            return Ok(id);
        }

        let id = inner.next.checked_add(1).ok_or(Error::IdSpaceExhausted)?;
        inner.next = id;
        inner.by_topic.insert(topic.to_string(), id);
        inner.by_id.insert(id, topic.to_string());
        Ok(id)
    }

    /// The id bound to `topic`, or `0` if unassigned.
    pub fn lookup_id(&self, topic: &str) -> u16 {
        self.inner.read().by_topic.get(topic).copied().unwrap_or(0)
    }

    /// The topic bound to `id`, if any.
    pub fn lookup_topic(&self, id: u16) -> Option<String> {
        self.inner.read().by_id.get(&id).cloned()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.inner.read().by_topic.contains_key(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_is_idempotent() {
        let index = TopicIndex::new();
        let a = index.get_or_assign("sensor/1/temp").unwrap();
        let b = index.get_or_assign("sensor/1/temp").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn zero_is_never_assigned() {
        let index = TopicIndex::new();
        for i in 0..100 {
            let id = index.get_or_assign(&format!("topic/{}", i)).unwrap();
            assert_ne!(id, 0);
        }
    }

    #[test]
    fn ids_are_monotonic() {
        let index = TopicIndex::new();
        let a = index.get_or_assign("a").unwrap();
        let b = index.get_or_assign("b").unwrap();
        let c = index.get_or_assign("c").unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn lookups_roundtrip() {
        let index = TopicIndex::new();
        let id = index.get_or_assign("device/gear-001/state").unwrap();
        assert_eq!(index.lookup_id("device/gear-001/state"), id);
        assert_eq!(index.lookup_topic(id).as_deref(), Some("device/gear-001/state"));
        assert!(index.contains("device/gear-001/state"));
    }

    #[test]
    fn unknown_lookups_are_empty() {
        let index = TopicIndex::new();
        assert_eq!(index.lookup_id("nope"), 0);
        assert_eq!(index.lookup_topic(17), None);
        assert!(!index.contains("nope"));
    }
}
