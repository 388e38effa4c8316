//! Bounded set of already-processed (session, message) pairs

use std::collections::{HashSet, VecDeque};

use crate::config::DEFAULT_DEDUP_CAPACITY;
use crate::types::{MessageId, SessionId};

type Key = (SessionId, MessageId);

/// FIFO-evicting deduplication set
#[derive(Debug)]
pub struct DedupSet {
    seen: HashSet<Key>,
    insertion_order: VecDeque<Key>,
    capacity: usize,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DEDUP_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            insertion_order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` without inserting if the pair was already seen
    pub fn mark_seen(&mut self, session_id: SessionId, message_id: MessageId) -> bool {
        let key = (session_id, message_id);
        if self.seen.contains(&key) {
            return false;
        }

        while self.seen.len() >= self.capacity {
            match self.insertion_order.pop_front() {
                Some(oldest) => {
                    self.seen.remove(&oldest);
                }
                None => break,
            }
        }

        self.seen.insert(key);
        self.insertion_order.push_back(key);
        true
    }

    pub fn contains(&self, session_id: SessionId, message_id: MessageId) -> bool {
        self.seen.contains(&(session_id, message_id))
    }

    /// Drop every entry belonging to a session
    pub fn clear_session(&mut self, session_id: SessionId) {
        self.seen.retain(|(sid, _)| *sid != session_id);
        self.insertion_order.retain(|(sid, _)| *sid != session_id);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DedupSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_mark_seen_once() {
        let mut set = DedupSet::new();
        let session = Uuid::new_v4();
        let message = Uuid::new_v4();

        assert!(set.mark_seen(session, message));
        assert!(!set.mark_seen(session, message));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_same_message_id_in_other_session() {
        let mut set = DedupSet::new();
        let message = Uuid::new_v4();

        assert!(set.mark_seen(Uuid::new_v4(), message));
        assert!(set.mark_seen(Uuid::new_v4(), message));
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let mut set = DedupSet::with_capacity(2);
        let session = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let third = Uuid::new_v4();

        set.mark_seen(session, first);
        set.mark_seen(session, second);
        set.mark_seen(session, third);

        assert_eq!(set.len(), 2);
        assert!(!set.contains(session, first));
        assert!(set.contains(session, second));
        assert!(set.contains(session, third));

        // evicted entries can be seen again
        assert!(set.mark_seen(session, first));
    }

    #[test]
    fn test_clear_session() {
        let mut set = DedupSet::new();
        let keep = Uuid::new_v4();
        let drop = Uuid::new_v4();
        let message = Uuid::new_v4();

        set.mark_seen(keep, message);
        set.mark_seen(drop, message);
        set.mark_seen(drop, Uuid::new_v4());
        set.clear_session(drop);

        assert_eq!(set.len(), 1);
        assert!(set.contains(keep, message));
        assert!(set.mark_seen(drop, message));
    }
}
