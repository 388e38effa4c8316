//! Core types for the ceremony protocol

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

/// Participant identifier (1-based position in the session's key list)
pub type ParticipantId = u16;

/// Unique identifier for a session
pub type SessionId = Uuid;

/// Identifier of an envelope or of a signing attempt
pub type MessageId = Uuid;

/// 32-byte transport identity key, hex encoded on the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey([u8; 32]);

impl PeerKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Fresh random identity, used for local ceremonies and tests
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse exactly 64 hex characters
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(Error::Deserialization(format!(
                "public key must be 64 hex characters, got {}",
                s.len()
            )));
        }
        let bytes = hex::decode(s).map_err(|e| Error::Deserialization(e.to_string()))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Deserialization("Invalid public key length".into()))?;
        Ok(Self(array))
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerKey({}..)", &self.to_hex()[..8])
    }
}

impl FromStr for PeerKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for PeerKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PeerKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// One ceremony instance
///
/// Participant ids are the 1-based positions in `participant_public_keys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: SessionId,
    pub coordinator_public_key: PeerKey,
    pub participant_public_keys: Vec<PeerKey>,
    pub threshold: u16,
    pub total_participants: u16,
}

impl Session {
    /// Create a session, enforcing `2 <= threshold <= total`
    pub fn new(
        session_id: SessionId,
        coordinator_public_key: PeerKey,
        participant_public_keys: Vec<PeerKey>,
        threshold: u16,
    ) -> Result<Self> {
        let total = u16::try_from(participant_public_keys.len())
            .map_err(|_| Error::InvalidConfig("Too many participants".into()))?;
        validate_threshold(threshold, total)?;

        let mut seen = std::collections::HashSet::new();
        if !participant_public_keys.iter().all(|key| seen.insert(*key)) {
            return Err(Error::InvalidConfig(
                "Participant public keys must be unique".into(),
            ));
        }

        Ok(Self {
            session_id,
            coordinator_public_key,
            participant_public_keys,
            threshold,
            total_participants: total,
        })
    }

    pub fn participant_key(&self, id: ParticipantId) -> Option<&PeerKey> {
        if id == 0 {
            return None;
        }
        self.participant_public_keys.get(usize::from(id) - 1)
    }

    pub fn participant_id_of(&self, key: &PeerKey) -> Option<ParticipantId> {
        self.participant_public_keys
            .iter()
            .position(|k| k == key)
            .and_then(|idx| ParticipantId::try_from(idx + 1).ok())
    }

    pub fn participant_ids(&self) -> impl Iterator<Item = ParticipantId> {
        1..=self.total_participants
    }

    pub fn is_participant(&self, id: ParticipantId) -> bool {
        id >= 1 && id <= self.total_participants
    }
}

/// Check `2 <= threshold <= total`
pub fn validate_threshold(threshold: u16, total: u16) -> Result<()> {
    if threshold < 2 {
        return Err(Error::InvalidConfig("Threshold must be at least 2".into()));
    }
    if threshold > total {
        return Err(Error::InvalidConfig(
            "Threshold cannot exceed number of participants".into(),
        ));
    }
    Ok(())
}

/// Round-1 public commitment of one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commitment {
    pub participant_id: ParticipantId,
    #[serde(with = "hex_vec")]
    pub hiding: Vec<u8>,
    #[serde(with = "hex_vec")]
    pub binding: Vec<u8>,
}

/// Round-2 partial signature of one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureShare {
    pub participant_id: ParticipantId,
    #[serde(with = "hex_vec")]
    pub share: Vec<u8>,
}

/// Which timer a machine armed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Overall session lifetime
    Session,
    /// Per-state round timer
    Round,
}

/// Armed timer; the epoch makes stale firings distinguishable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub kind: TimerKind,
    pub epoch: u64,
}

pub(crate) mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod hex_opt_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(opt: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match opt {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => hex::decode(&s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<PeerKey> {
        (0..n).map(|i| PeerKey::new([i as u8 + 1; 32])).collect()
    }

    #[test]
    fn test_peer_key_hex() {
        let key = PeerKey::new([0xab; 32]);
        let parsed = PeerKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key, parsed);

        assert!(PeerKey::from_hex("abcd").is_err());
        assert!(PeerKey::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_session_threshold_bounds() {
        let coordinator = PeerKey::new([9; 32]);
        assert!(Session::new(Uuid::new_v4(), coordinator, keys(3), 2).is_ok());
        assert!(Session::new(Uuid::new_v4(), coordinator, keys(3), 3).is_ok());
        assert!(Session::new(Uuid::new_v4(), coordinator, keys(3), 1).is_err());
        assert!(Session::new(Uuid::new_v4(), coordinator, keys(3), 4).is_err());
    }

    #[test]
    fn test_session_rejects_duplicate_keys() {
        let mut participants = keys(2);
        participants.push(participants[0]);
        let result = Session::new(Uuid::new_v4(), PeerKey::new([9; 32]), participants, 2);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_participant_lookup() {
        let participants = keys(3);
        let session =
            Session::new(Uuid::new_v4(), PeerKey::new([9; 32]), participants.clone(), 2).unwrap();

        assert_eq!(session.participant_key(1), Some(&participants[0]));
        assert_eq!(session.participant_key(0), None);
        assert_eq!(session.participant_key(4), None);
        assert_eq!(session.participant_id_of(&participants[2]), Some(3));
        assert_eq!(session.participant_ids().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_commitment_wire_shape() {
        let commitment = Commitment {
            participant_id: 2,
            hiding: vec![0xaa],
            binding: vec![0xbb],
        };
        let json = serde_json::to_value(&commitment).unwrap();
        assert_eq!(json["participantId"], 2);
        assert_eq!(json["hiding"], "aa");
        assert_eq!(json["binding"], "bb");
    }
}
