//! Per-attempt bookkeeping owned by the coordinator

use std::collections::BTreeMap;

use crate::backend::{PublicKeyPackage, SigningContext};
use crate::types::{Commitment, MessageId, ParticipantId, SignatureShare};

/// One signing attempt inside a session
#[derive(Debug, Clone)]
pub struct SigningAttempt {
    pub attempt_id: MessageId,
    pub message: Vec<u8>,
    pub signer_ids: Vec<ParticipantId>,
    pub backend_id: String,
    pub requires_randomizer: bool,
    pub public_key_package: PublicKeyPackage,
    pub group_public_key: Vec<u8>,
    pub(crate) commitments: BTreeMap<ParticipantId, Commitment>,
    pub(crate) shares: BTreeMap<ParticipantId, SignatureShare>,
    pub signing_package: Option<Vec<u8>>,
    pub randomizer: Option<Vec<u8>>,
    pub signature: Option<Vec<u8>>,
    pub verified: bool,
}

impl SigningAttempt {
    pub fn new(
        attempt_id: MessageId,
        message: Vec<u8>,
        signer_ids: Vec<ParticipantId>,
        backend_id: String,
        requires_randomizer: bool,
        public_key_package: PublicKeyPackage,
        group_public_key: Vec<u8>,
    ) -> Self {
        Self {
            attempt_id,
            message,
            signer_ids,
            backend_id,
            requires_randomizer,
            public_key_package,
            group_public_key,
            commitments: BTreeMap::new(),
            shares: BTreeMap::new(),
            signing_package: None,
            randomizer: None,
            signature: None,
            verified: false,
        }
    }

    pub fn is_signer(&self, id: ParticipantId) -> bool {
        self.signer_ids.contains(&id)
    }

    /// Store a commitment from a selected signer; last write wins
    pub fn record_commitment(&mut self, commitment: Commitment) -> bool {
        if !self.is_signer(commitment.participant_id) {
            return false;
        }
        self.commitments.insert(commitment.participant_id, commitment);
        true
    }

    /// Store a share; only signers with a recorded commitment may answer
    pub fn record_share(&mut self, share: SignatureShare) -> bool {
        if !self.commitments.contains_key(&share.participant_id) {
            return false;
        }
        self.shares.insert(share.participant_id, share);
        true
    }

    pub fn has_all_commitments(&self) -> bool {
        self.signer_ids
            .iter()
            .all(|id| self.commitments.contains_key(id))
    }

    /// Every signer that committed has also answered round 2
    pub fn has_all_shares(&self) -> bool {
        !self.commitments.is_empty()
            && self.commitments.keys().all(|id| self.shares.contains_key(id))
    }

    pub fn commitment_count(&self) -> usize {
        self.commitments.len()
    }

    pub fn share_count(&self) -> usize {
        self.shares.len()
    }

    pub fn committed_ids(&self) -> Vec<ParticipantId> {
        self.commitments.keys().copied().collect()
    }

    pub fn missing_commitments(&self) -> Vec<ParticipantId> {
        self.signer_ids
            .iter()
            .copied()
            .filter(|id| !self.commitments.contains_key(id))
            .collect()
    }

    pub fn missing_shares(&self) -> Vec<ParticipantId> {
        self.commitments
            .keys()
            .copied()
            .filter(|id| !self.shares.contains_key(id))
            .collect()
    }

    /// Drop signers that never committed
    pub fn narrow_to_committed(&mut self) {
        self.signer_ids = self.committed_ids();
    }

    pub fn commitments(&self) -> Vec<Commitment> {
        self.commitments.values().cloned().collect()
    }

    pub fn shares(&self) -> Vec<SignatureShare> {
        self.shares.values().cloned().collect()
    }

    /// Context for aggregation, once the signing package exists
    pub fn signing_context(&self) -> Option<SigningContext> {
        Some(SigningContext {
            message: self.message.clone(),
            commitments: self.commitments(),
            signing_package: self.signing_package.clone()?,
            randomizer: self.randomizer.clone(),
            group_public_key: self.group_public_key.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn attempt(signers: Vec<ParticipantId>) -> SigningAttempt {
        SigningAttempt::new(
            Uuid::new_v4(),
            b"msg".to_vec(),
            signers,
            "frost-secp256k1".into(),
            false,
            PublicKeyPackage {
                backend_id: "frost-secp256k1".into(),
                group_public_key: vec![2; 33],
                verifying_shares: vec![],
            },
            vec![2; 33],
        )
    }

    fn commitment(id: ParticipantId) -> Commitment {
        Commitment {
            participant_id: id,
            hiding: vec![id as u8],
            binding: vec![id as u8],
        }
    }

    #[test]
    fn test_commitments_only_from_signers() {
        let mut attempt = attempt(vec![1, 2]);
        assert!(!attempt.record_commitment(commitment(3)));
        assert!(attempt.record_commitment(commitment(2)));
        assert!(!attempt.has_all_commitments());
        assert_eq!(attempt.missing_commitments(), vec![1]);

        assert!(attempt.record_commitment(commitment(1)));
        assert!(attempt.has_all_commitments());
    }

    #[test]
    fn test_share_requires_commitment() {
        let mut attempt = attempt(vec![1, 2]);
        attempt.record_commitment(commitment(1));

        let share = |id| SignatureShare {
            participant_id: id,
            share: vec![1; 32],
        };
        assert!(!attempt.record_share(share(2)));
        assert!(attempt.record_share(share(1)));
        assert!(attempt.has_all_shares());
    }

    #[test]
    fn test_narrow_to_committed() {
        let mut attempt = attempt(vec![1, 2, 3]);
        attempt.record_commitment(commitment(3));
        attempt.record_commitment(commitment(1));
        attempt.narrow_to_committed();
        assert_eq!(attempt.signer_ids, vec![1, 3]);
        assert!(attempt.has_all_commitments());
    }
}
