//! Message envelope and wire codec
//!
//! Every message travels as a JSON envelope:
//!
//! ```json
//! { "protocolVersion": 1, "sessionId": "...", "messageId": "...",
//!   "type": "ROUND1_COMMITMENT", "senderPublicKey": "<64 hex>",
//!   "timestamp": 1700000000000, "payload": { ... } }
//! ```
//!
//! Decoding goes through [`crate::validation::validate`]; this module only
//! builds and encodes envelopes.

mod payload;

pub use payload::*;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use uuid::Uuid;

use crate::types::{MessageId, PeerKey, SessionId};
use crate::Result;

/// The single supported protocol version
pub const PROTOCOL_VERSION: u64 = 1;

/// Closed set of message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    SigningPackage,
    Round1Commitment,
    CommitmentsSet,
    Round2SignatureShare,
    SignatureResult,
    Abort,
}

impl MessageType {
    pub const ALL: [MessageType; 6] = [
        MessageType::SigningPackage,
        MessageType::Round1Commitment,
        MessageType::CommitmentsSet,
        MessageType::Round2SignatureShare,
        MessageType::SignatureResult,
        MessageType::Abort,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::SigningPackage => "SIGNING_PACKAGE",
            MessageType::Round1Commitment => "ROUND1_COMMITMENT",
            MessageType::CommitmentsSet => "COMMITMENTS_SET",
            MessageType::Round2SignatureShare => "ROUND2_SIGNATURE_SHARE",
            MessageType::SignatureResult => "SIGNATURE_RESULT",
            MessageType::Abort => "ABORT",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload, one variant per message type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    SigningPackage(SigningPackagePayload),
    Round1Commitment(Round1CommitmentPayload),
    CommitmentsSet(CommitmentsSetPayload),
    Round2SignatureShare(Round2SignatureSharePayload),
    SignatureResult(SignatureResultPayload),
    Abort(AbortPayload),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::SigningPackage(_) => MessageType::SigningPackage,
            Payload::Round1Commitment(_) => MessageType::Round1Commitment,
            Payload::CommitmentsSet(_) => MessageType::CommitmentsSet,
            Payload::Round2SignatureShare(_) => MessageType::Round2SignatureShare,
            Payload::SignatureResult(_) => MessageType::SignatureResult,
            Payload::Abort(_) => MessageType::Abort,
        }
    }

    /// Signing attempt this payload claims to belong to
    pub fn attempt_id(&self) -> Option<MessageId> {
        match self {
            Payload::SigningPackage(p) => Some(p.attempt_id),
            Payload::Round1Commitment(p) => Some(p.attempt_id),
            Payload::CommitmentsSet(p) => Some(p.attempt_id),
            Payload::Round2SignatureShare(p) => Some(p.attempt_id),
            Payload::SignatureResult(p) => Some(p.attempt_id),
            Payload::Abort(p) => p.attempt_id,
        }
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            Payload::SigningPackage(p) => serde_json::to_value(p),
            Payload::Round1Commitment(p) => serde_json::to_value(p),
            Payload::CommitmentsSet(p) => serde_json::to_value(p),
            Payload::Round2SignatureShare(p) => serde_json::to_value(p),
            Payload::SignatureResult(p) => serde_json::to_value(p),
            Payload::Abort(p) => serde_json::to_value(p),
        }
    }

    pub fn from_value(message_type: MessageType, value: Value) -> serde_json::Result<Self> {
        Ok(match message_type {
            MessageType::SigningPackage => Payload::SigningPackage(serde_json::from_value(value)?),
            MessageType::Round1Commitment => {
                Payload::Round1Commitment(serde_json::from_value(value)?)
            }
            MessageType::CommitmentsSet => Payload::CommitmentsSet(serde_json::from_value(value)?),
            MessageType::Round2SignatureShare => {
                Payload::Round2SignatureShare(serde_json::from_value(value)?)
            }
            MessageType::SignatureResult => {
                Payload::SignatureResult(serde_json::from_value(value)?)
            }
            MessageType::Abort => Payload::Abort(serde_json::from_value(value)?),
        })
    }
}

/// Immutable message envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub protocol_version: u64,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub sender_public_key: PeerKey,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub payload: Payload,
}

impl Envelope {
    /// Build an envelope with a fresh message id, stamped now
    pub fn new(session_id: SessionId, sender: PeerKey, payload: Payload) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            session_id,
            message_id: Uuid::new_v4(),
            sender_public_key: sender,
            timestamp: Utc::now().timestamp_millis(),
            payload,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(json!({
            "protocolVersion": self.protocol_version,
            "sessionId": self.session_id.to_string(),
            "messageId": self.message_id.to_string(),
            "type": self.message_type().as_str(),
            "senderPublicKey": self.sender_public_key.to_hex(),
            "timestamp": self.timestamp,
            "payload": self.payload.to_value()?,
        }))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_value()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_wire_names() {
        for ty in MessageType::ALL {
            assert_eq!(MessageType::from_wire(ty.as_str()), Some(ty));
            let json = serde_json::to_value(ty).unwrap();
            assert_eq!(json, ty.as_str());
        }
        assert_eq!(MessageType::from_wire("round1_commitment"), None);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let payload = Payload::Abort(
            AbortPayload::new(AbortReason::UserCancelled, None).with_message("operator cancelled"),
        );
        let envelope = Envelope::new(Uuid::new_v4(), PeerKey::new([7; 32]), payload);
        let value = envelope.to_value().unwrap();

        assert_eq!(value["protocolVersion"], 1);
        assert_eq!(value["type"], "ABORT");
        assert_eq!(value["senderPublicKey"], "07".repeat(32));
        assert_eq!(value["payload"]["reason"], "user_cancelled");
        assert_eq!(value["payload"]["message"], "operator cancelled");
        assert!(value["payload"].get("attemptId").is_none());
    }

    #[test]
    fn test_commitments_set_omits_absent_randomizer() {
        let payload = CommitmentsSetPayload {
            attempt_id: Uuid::new_v4(),
            commitments: vec![],
            signing_package: vec![1],
            randomizer: None,
            group_public_key: vec![2],
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("randomizer").is_none());

        let parsed: CommitmentsSetPayload = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.randomizer, None);
    }
}
