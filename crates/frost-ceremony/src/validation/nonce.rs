//! Round-1 nonce usage tracking
//!
//! Signing two attempts with the same nonce material leaks the secret
//! share, so a repeated (participant, attempt) pair must abort the ceremony.

use std::collections::{HashMap, HashSet};

use crate::types::{MessageId, ParticipantId};

#[derive(Debug, Default)]
pub struct NonceTracker {
    used: HashMap<ParticipantId, HashSet<MessageId>>,
}

impl NonceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if this participant already consumed a nonce for `attempt_id`
    pub fn record_nonce_usage(&mut self, participant_id: ParticipantId, attempt_id: MessageId) -> bool {
        self.used.entry(participant_id).or_default().insert(attempt_id)
    }

    pub fn has_used(&self, participant_id: ParticipantId, attempt_id: MessageId) -> bool {
        self.used
            .get(&participant_id)
            .is_some_and(|attempts| attempts.contains(&attempt_id))
    }

    pub fn usage_count(&self, participant_id: ParticipantId) -> usize {
        self.used.get(&participant_id).map_or(0, HashSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_reuse_detected() {
        let mut tracker = NonceTracker::new();
        let attempt = Uuid::new_v4();

        assert!(tracker.record_nonce_usage(1, attempt));
        assert!(!tracker.record_nonce_usage(1, attempt));
        assert!(tracker.has_used(1, attempt));
    }

    #[test]
    fn test_participants_tracked_independently() {
        let mut tracker = NonceTracker::new();
        let attempt = Uuid::new_v4();

        assert!(tracker.record_nonce_usage(1, attempt));
        assert!(tracker.record_nonce_usage(2, attempt));
        assert!(tracker.record_nonce_usage(1, Uuid::new_v4()));
        assert_eq!(tracker.usage_count(1), 2);
        assert_eq!(tracker.usage_count(3), 0);
    }
}
