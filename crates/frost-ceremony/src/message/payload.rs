//! Typed payloads for each message type

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{hex_opt_vec, hex_vec, Commitment, MessageId, ParticipantId, SignatureShare};

/// Coordinator -> participants: start a signing attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningPackagePayload {
    pub attempt_id: MessageId,
    #[serde(with = "hex_vec")]
    pub message: Vec<u8>,
    pub signer_ids: Vec<ParticipantId>,
    pub backend_id: String,
}

/// Participant -> coordinator: round-1 commitment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round1CommitmentPayload {
    pub attempt_id: MessageId,
    pub commitment: Commitment,
}

/// Coordinator -> signers: every commitment plus the signing package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitmentsSetPayload {
    pub attempt_id: MessageId,
    pub commitments: Vec<Commitment>,
    #[serde(with = "hex_vec")]
    pub signing_package: Vec<u8>,
    #[serde(default, with = "hex_opt_vec", skip_serializing_if = "Option::is_none")]
    pub randomizer: Option<Vec<u8>>,
    #[serde(with = "hex_vec")]
    pub group_public_key: Vec<u8>,
}

impl CommitmentsSetPayload {
    pub fn commitment_of(&self, id: ParticipantId) -> Option<&Commitment> {
        self.commitments.iter().find(|c| c.participant_id == id)
    }
}

/// Participant -> coordinator: partial signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round2SignatureSharePayload {
    pub attempt_id: MessageId,
    pub share: SignatureShare,
}

/// Coordinator -> signers: aggregated signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureResultPayload {
    pub attempt_id: MessageId,
    #[serde(with = "hex_vec")]
    pub signature: Vec<u8>,
    pub verified: bool,
}

/// Either direction: ceremony termination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortPayload {
    pub reason: AbortReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<MessageId>,
}

impl AbortPayload {
    pub fn new(reason: AbortReason, attempt_id: Option<MessageId>) -> Self {
        Self {
            reason,
            message: None,
            attempt_id,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Wire-visible abort reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Timeout,
    ThresholdNotMet,
    InvalidCommitment,
    InvalidShare,
    AggregationFailed,
    UserCancelled,
    SessionExpired,
    BackendMismatch,
    MessageIdMismatch,
    ProtocolError,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::Timeout => "timeout",
            AbortReason::ThresholdNotMet => "threshold_not_met",
            AbortReason::InvalidCommitment => "invalid_commitment",
            AbortReason::InvalidShare => "invalid_share",
            AbortReason::AggregationFailed => "aggregation_failed",
            AbortReason::UserCancelled => "user_cancelled",
            AbortReason::SessionExpired => "session_expired",
            AbortReason::BackendMismatch => "backend_mismatch",
            AbortReason::MessageIdMismatch => "message_id_mismatch",
            AbortReason::ProtocolError => "protocol_error",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
