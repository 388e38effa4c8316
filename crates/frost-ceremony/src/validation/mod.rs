//! Inbound message validation
//!
//! [`validate`] turns raw transport bytes into a typed [`Envelope`] or a
//! structured [`ValidationError`]. Checks run in a fixed order and stop at
//! the first failure:
//!
//! 1. envelope structure
//! 2. freshness (optional)
//! 3. session binding
//! 4. phase ordering
//! 5. deduplication
//! 6. attempt linkage
//! 7. payload-specific checks
//!
//! Failures in steps 1-4 leave the deduplication set untouched, so a
//! corrected or later resend of the same message can still be accepted.

mod dedup;
mod nonce;

pub use dedup::DedupSet;
pub use nonce::NonceTracker;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::config::CeremonyConfig;
use crate::message::{Envelope, MessageType, Payload, PROTOCOL_VERSION};
use crate::types::{Commitment, MessageId, ParticipantId, PeerKey, SessionId};

/// Protocol phase a receiver is currently in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolPhase {
    Idle,
    Round1,
    CommitmentsSent,
    Round2,
    Complete,
}

impl ProtocolPhase {
    /// Whether a message of this type may arrive in this phase
    pub fn allows(&self, message_type: MessageType) -> bool {
        match message_type {
            MessageType::Abort | MessageType::SigningPackage => true,
            MessageType::Round1Commitment | MessageType::CommitmentsSet => {
                matches!(self, ProtocolPhase::Round1)
            }
            MessageType::Round2SignatureShare => {
                matches!(self, ProtocolPhase::CommitmentsSent | ProtocolPhase::Round2)
            }
            MessageType::SignatureResult => matches!(self, ProtocolPhase::Round2),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolPhase::Idle => "idle",
            ProtocolPhase::Round1 => "round1",
            ProtocolPhase::CommitmentsSent => "commitments_sent",
            ProtocolPhase::Round2 => "round2",
            ProtocolPhase::Complete => "complete",
        }
    }
}

impl fmt::Display for ProtocolPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of validation failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationErrorCode {
    InvalidEnvelope,
    UnsupportedVersion,
    InvalidSessionId,
    InvalidMessageId,
    InvalidPublicKey,
    InvalidTimestamp,
    UnknownMessageType,
    MissingPayload,
    MessageTooOld,
    MessageFromFuture,
    SessionMismatch,
    MonotonicityViolation,
    DuplicateMessage,
    MessageIdMismatch,
    InvalidPayload,
    DuplicateParticipant,
    MissingRandomizer,
    BackendMismatch,
}

impl ValidationErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationErrorCode::InvalidEnvelope => "InvalidEnvelope",
            ValidationErrorCode::UnsupportedVersion => "UnsupportedVersion",
            ValidationErrorCode::InvalidSessionId => "InvalidSessionId",
            ValidationErrorCode::InvalidMessageId => "InvalidMessageId",
            ValidationErrorCode::InvalidPublicKey => "InvalidPublicKey",
            ValidationErrorCode::InvalidTimestamp => "InvalidTimestamp",
            ValidationErrorCode::UnknownMessageType => "UnknownMessageType",
            ValidationErrorCode::MissingPayload => "MissingPayload",
            ValidationErrorCode::MessageTooOld => "MessageTooOld",
            ValidationErrorCode::MessageFromFuture => "MessageFromFuture",
            ValidationErrorCode::SessionMismatch => "SessionMismatch",
            ValidationErrorCode::MonotonicityViolation => "MonotonicityViolation",
            ValidationErrorCode::DuplicateMessage => "DuplicateMessage",
            ValidationErrorCode::MessageIdMismatch => "MessageIdMismatch",
            ValidationErrorCode::InvalidPayload => "InvalidPayload",
            ValidationErrorCode::DuplicateParticipant => "DuplicateParticipant",
            ValidationErrorCode::MissingRandomizer => "MissingRandomizer",
            ValidationErrorCode::BackendMismatch => "BackendMismatch",
        }
    }

    /// True when the failure happened before the dedup step, so the same
    /// message id can still be accepted later
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ValidationErrorCode::DuplicateMessage
                | ValidationErrorCode::MessageIdMismatch
                | ValidationErrorCode::InvalidPayload
                | ValidationErrorCode::DuplicateParticipant
                | ValidationErrorCode::MissingRandomizer
                | ValidationErrorCode::BackendMismatch
        )
    }
}

impl fmt::Display for ValidationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured `(code, message, details)` validation failure
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{code}: {message}")]
pub struct ValidationError {
    pub code: ValidationErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ValidationError {
    pub fn new(code: ValidationErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

/// Freshness window, evaluated against a fixed "now"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub now_ms: i64,
    pub max_age_ms: i64,
    pub max_skew_ms: i64,
}

impl Freshness {
    pub const DEFAULT_MAX_AGE_MS: i64 = 10 * 60 * 1000;
    pub const DEFAULT_MAX_SKEW_MS: i64 = 60 * 1000;

    pub fn at(now_ms: i64) -> Self {
        Self {
            now_ms,
            max_age_ms: Self::DEFAULT_MAX_AGE_MS,
            max_skew_ms: Self::DEFAULT_MAX_SKEW_MS,
        }
    }

    pub fn now() -> Self {
        Self::at(Utc::now().timestamp_millis())
    }

    /// Current time with the configured window, or `None` when disabled
    pub fn from_config(config: &CeremonyConfig) -> Option<Self> {
        config.check_freshness.then(|| Self {
            now_ms: Utc::now().timestamp_millis(),
            max_age_ms: i64::try_from(config.max_message_age.as_millis()).unwrap_or(i64::MAX),
            max_skew_ms: i64::try_from(config.max_clock_skew.as_millis()).unwrap_or(i64::MAX),
        })
    }
}

/// What the receiver expects of the next inbound message
pub struct ValidationContext<'a> {
    pub session_id: SessionId,
    /// Attempt the receiver is tracking; `None` before any signing package
    pub attempt_id: Option<MessageId>,
    pub backend_id: Option<&'a str>,
    pub requires_randomizer: bool,
    /// `None` disables the phase check
    pub phase: Option<ProtocolPhase>,
    /// `None` disables the freshness check
    pub freshness: Option<Freshness>,
    pub dedup: &'a mut DedupSet,
}

impl<'a> ValidationContext<'a> {
    pub fn new(session_id: SessionId, dedup: &'a mut DedupSet) -> Self {
        Self {
            session_id,
            attempt_id: None,
            backend_id: None,
            requires_randomizer: false,
            phase: None,
            freshness: None,
            dedup,
        }
    }

    pub fn attempt(mut self, attempt_id: Option<MessageId>) -> Self {
        self.attempt_id = attempt_id;
        self
    }

    pub fn backend(mut self, backend_id: &'a str, requires_randomizer: bool) -> Self {
        self.backend_id = Some(backend_id);
        self.requires_randomizer = requires_randomizer;
        self
    }

    pub fn phase(mut self, phase: ProtocolPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn freshness(mut self, freshness: Option<Freshness>) -> Self {
        self.freshness = freshness;
        self
    }
}

/// Validate raw transport bytes
pub fn validate(raw: &[u8], ctx: &mut ValidationContext<'_>) -> Result<Envelope, ValidationError> {
    let value: Value = serde_json::from_slice(raw).map_err(|e| {
        ValidationError::new(ValidationErrorCode::InvalidEnvelope, format!("not valid JSON: {}", e))
    })?;
    validate_value(&value, ctx)
}

/// Validate an already-parsed JSON envelope
pub fn validate_value(
    value: &Value,
    ctx: &mut ValidationContext<'_>,
) -> Result<Envelope, ValidationError> {
    // 1. structure
    let header = check_structure(value)?;

    // 2. freshness
    if let Some(freshness) = ctx.freshness {
        check_freshness(header.timestamp, &freshness)?;
    }

    // 3. session binding
    if header.session_id != ctx.session_id {
        return Err(ValidationError::new(
            ValidationErrorCode::SessionMismatch,
            "envelope belongs to a different session",
        )
        .with_details(json!({
            "expected": ctx.session_id.to_string(),
            "received": header.session_id.to_string(),
        })));
    }

    // 4. phase ordering
    if let Some(phase) = ctx.phase {
        if !phase.allows(header.message_type) {
            return Err(ValidationError::new(
                ValidationErrorCode::MonotonicityViolation,
                format!("{} is not accepted in phase {}", header.message_type, phase),
            )
            .with_details(json!({
                "type": header.message_type.as_str(),
                "phase": phase.as_str(),
            })));
        }
    }

    // 5. deduplication
    if !ctx.dedup.mark_seen(header.session_id, header.message_id) {
        return Err(ValidationError::new(
            ValidationErrorCode::DuplicateMessage,
            "message already processed",
        )
        .with_details(json!({ "messageId": header.message_id.to_string() })));
    }

    let payload = Payload::from_value(header.message_type, header.payload.clone()).map_err(|e| {
        ValidationError::new(
            ValidationErrorCode::InvalidPayload,
            format!("malformed {} payload: {}", header.message_type, e),
        )
    })?;

    // 6. attempt linkage; a signing package starts a new attempt
    if header.message_type != MessageType::SigningPackage {
        if let (Some(expected), Some(received)) = (ctx.attempt_id, payload.attempt_id()) {
            if expected != received {
                return Err(ValidationError::new(
                    ValidationErrorCode::MessageIdMismatch,
                    "payload belongs to a different signing attempt",
                )
                .with_details(json!({
                    "expected": expected.to_string(),
                    "received": received.to_string(),
                })));
            }
        }
    }

    // 7. payload-specific checks
    check_payload(&payload, ctx)?;

    Ok(Envelope {
        protocol_version: PROTOCOL_VERSION,
        session_id: header.session_id,
        message_id: header.message_id,
        sender_public_key: header.sender,
        timestamp: header.timestamp,
        payload,
    })
}

struct Header<'v> {
    session_id: SessionId,
    message_id: MessageId,
    message_type: MessageType,
    sender: PeerKey,
    timestamp: i64,
    payload: &'v Value,
}

fn invalid(code: ValidationErrorCode, message: impl Into<String>) -> ValidationError {
    ValidationError::new(code, message)
}

fn required<'v>(obj: &'v Map<String, Value>, name: &str) -> Result<&'v Value, ValidationError> {
    obj.get(name).filter(|v| !v.is_null()).ok_or_else(|| {
        invalid(
            ValidationErrorCode::InvalidEnvelope,
            format!("missing field `{}`", name),
        )
    })
}

fn parse_uuid(value: &Value, code: ValidationErrorCode, name: &str) -> Result<Uuid, ValidationError> {
    let s = value
        .as_str()
        .ok_or_else(|| invalid(code, format!("`{}` must be a string", name)))?;
    if s.len() != 36 {
        return Err(invalid(code, format!("`{}` is not a hyphenated UUID", name)));
    }
    Uuid::parse_str(s).map_err(|e| invalid(code, format!("`{}`: {}", name, e)))
}

fn check_structure(value: &Value) -> Result<Header<'_>, ValidationError> {
    let obj = value.as_object().ok_or_else(|| {
        invalid(ValidationErrorCode::InvalidEnvelope, "envelope must be a JSON object")
    })?;

    let version = required(obj, "protocolVersion")?;
    if version.as_u64() != Some(PROTOCOL_VERSION) {
        return Err(invalid(
            ValidationErrorCode::UnsupportedVersion,
            format!("unsupported protocol version {}", version),
        )
        .with_details(json!({ "supported": PROTOCOL_VERSION, "received": version })));
    }

    let session_id = parse_uuid(
        required(obj, "sessionId")?,
        ValidationErrorCode::InvalidSessionId,
        "sessionId",
    )?;
    let message_id = parse_uuid(
        required(obj, "messageId")?,
        ValidationErrorCode::InvalidMessageId,
        "messageId",
    )?;

    let type_name = required(obj, "type")?.as_str().ok_or_else(|| {
        invalid(ValidationErrorCode::UnknownMessageType, "`type` must be a string")
    })?;
    let message_type = MessageType::from_wire(type_name).ok_or_else(|| {
        invalid(
            ValidationErrorCode::UnknownMessageType,
            format!("unknown message type `{}`", type_name),
        )
    })?;

    let sender = required(obj, "senderPublicKey")?
        .as_str()
        .and_then(|s| PeerKey::from_hex(s).ok())
        .ok_or_else(|| {
            invalid(
                ValidationErrorCode::InvalidPublicKey,
                "`senderPublicKey` must be 64 hex characters",
            )
        })?;

    let raw_timestamp = required(obj, "timestamp")?;
    let timestamp = match raw_timestamp.as_f64() {
        Some(ts) if ts.is_finite() => raw_timestamp.as_i64().unwrap_or(ts as i64),
        _ => {
            return Err(invalid(
                ValidationErrorCode::InvalidTimestamp,
                "`timestamp` must be a finite number",
            ))
        }
    };

    let payload = obj
        .get("payload")
        .filter(|v| !v.is_null())
        .ok_or_else(|| invalid(ValidationErrorCode::MissingPayload, "missing payload"))?;
    if !payload.is_object() {
        return Err(invalid(
            ValidationErrorCode::InvalidEnvelope,
            "`payload` must be a JSON object",
        ));
    }

    Ok(Header {
        session_id,
        message_id,
        message_type,
        sender,
        timestamp,
        payload,
    })
}

fn check_freshness(timestamp: i64, freshness: &Freshness) -> Result<(), ValidationError> {
    let age = freshness.now_ms.saturating_sub(timestamp);
    if age > freshness.max_age_ms {
        return Err(invalid(
            ValidationErrorCode::MessageTooOld,
            format!("message is {} ms old", age),
        )
        .with_details(json!({ "ageMs": age, "maxAgeMs": freshness.max_age_ms })));
    }
    let ahead = timestamp.saturating_sub(freshness.now_ms);
    if ahead > freshness.max_skew_ms {
        return Err(invalid(
            ValidationErrorCode::MessageFromFuture,
            format!("message is {} ms in the future", ahead),
        )
        .with_details(json!({ "aheadMs": ahead, "maxSkewMs": freshness.max_skew_ms })));
    }
    Ok(())
}

fn invalid_payload(message: impl Into<String>) -> ValidationError {
    invalid(ValidationErrorCode::InvalidPayload, message)
}

fn check_participant_id(id: ParticipantId) -> Result<(), ValidationError> {
    if id == 0 {
        return Err(invalid_payload("participant ids must be positive"));
    }
    Ok(())
}

fn check_commitment(commitment: &Commitment) -> Result<(), ValidationError> {
    check_participant_id(commitment.participant_id)?;
    if commitment.hiding.is_empty() || commitment.binding.is_empty() {
        return Err(invalid_payload(format!(
            "commitment of participant {} is empty",
            commitment.participant_id
        )));
    }
    Ok(())
}

fn check_unique(ids: impl IntoIterator<Item = ParticipantId>) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(invalid(
                ValidationErrorCode::DuplicateParticipant,
                format!("participant {} listed more than once", id),
            )
            .with_details(json!({ "participantId": id })));
        }
    }
    Ok(())
}

fn check_payload(payload: &Payload, ctx: &ValidationContext<'_>) -> Result<(), ValidationError> {
    match payload {
        Payload::SigningPackage(p) => {
            if p.message.is_empty() {
                return Err(invalid_payload("message to sign is empty"));
            }
            if p.signer_ids.is_empty() {
                return Err(invalid_payload("signer list is empty"));
            }
            for id in &p.signer_ids {
                check_participant_id(*id)?;
            }
            check_unique(p.signer_ids.iter().copied())?;
            if let Some(expected) = ctx.backend_id {
                if p.backend_id != expected {
                    return Err(invalid(
                        ValidationErrorCode::BackendMismatch,
                        format!("coordinator uses backend `{}`", p.backend_id),
                    )
                    .with_details(json!({ "expected": expected, "received": p.backend_id })));
                }
            }
        }
        Payload::Round1Commitment(p) => check_commitment(&p.commitment)?,
        Payload::CommitmentsSet(p) => {
            if p.commitments.is_empty() {
                return Err(invalid_payload("commitment set is empty"));
            }
            for commitment in &p.commitments {
                check_commitment(commitment)?;
            }
            check_unique(p.commitments.iter().map(|c| c.participant_id))?;
            if p.signing_package.is_empty() {
                return Err(invalid_payload("signing package is empty"));
            }
            if p.group_public_key.is_empty() {
                return Err(invalid_payload("group public key is empty"));
            }
            if ctx.requires_randomizer && p.randomizer.as_ref().map_or(true, Vec::is_empty) {
                return Err(invalid(
                    ValidationErrorCode::MissingRandomizer,
                    "backend requires a randomizer",
                ));
            }
        }
        Payload::Round2SignatureShare(p) => {
            check_participant_id(p.share.participant_id)?;
            if p.share.share.is_empty() {
                return Err(invalid_payload("signature share is empty"));
            }
        }
        Payload::SignatureResult(p) => {
            if p.signature.is_empty() {
                return Err(invalid_payload("signature is empty"));
            }
        }
        Payload::Abort(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{
        AbortPayload, AbortReason, CommitmentsSetPayload, Round1CommitmentPayload,
        Round2SignatureSharePayload, SigningPackagePayload,
    };
    use crate::types::SignatureShare;

    const NOW: i64 = 1_700_000_000_000;

    fn commitment(id: ParticipantId) -> Commitment {
        Commitment {
            participant_id: id,
            hiding: vec![id as u8; 33],
            binding: vec![id as u8 + 1; 33],
        }
    }

    fn envelope(session_id: SessionId, payload: Payload) -> Envelope {
        Envelope::new(session_id, PeerKey::new([3; 32]), payload).with_timestamp(NOW)
    }

    fn share_envelope(session_id: SessionId, attempt_id: MessageId) -> Envelope {
        envelope(
            session_id,
            Payload::Round2SignatureShare(Round2SignatureSharePayload {
                attempt_id,
                share: SignatureShare {
                    participant_id: 1,
                    share: vec![9; 32],
                },
            }),
        )
    }

    fn commitments_set(attempt_id: MessageId, randomizer: Option<Vec<u8>>) -> Payload {
        Payload::CommitmentsSet(CommitmentsSetPayload {
            attempt_id,
            commitments: vec![commitment(1), commitment(2)],
            signing_package: vec![1, 2, 3],
            randomizer,
            group_public_key: vec![2; 33],
        })
    }

    fn run(value: &Value, ctx: &mut ValidationContext<'_>) -> Result<Envelope, ValidationError> {
        validate_value(value, ctx)
    }

    fn code_of(result: Result<Envelope, ValidationError>) -> ValidationErrorCode {
        result.expect_err("expected rejection").code
    }

    #[test]
    fn test_valid_envelope_accepted_then_duplicate() {
        let session_id = Uuid::new_v4();
        let mut dedup = DedupSet::new();
        let env = share_envelope(session_id, Uuid::new_v4());
        let bytes = env.to_bytes().unwrap();

        let mut ctx = ValidationContext::new(session_id, &mut dedup);
        let parsed = validate(&bytes, &mut ctx).unwrap();
        assert_eq!(parsed, env);

        assert_eq!(
            code_of(validate(&bytes, &mut ctx)),
            ValidationErrorCode::DuplicateMessage
        );
    }

    #[test]
    fn test_every_message_type_accepted_without_phase() {
        let session_id = Uuid::new_v4();
        let attempt_id = Uuid::new_v4();
        let mut dedup = DedupSet::new();
        let payloads = vec![
            Payload::SigningPackage(SigningPackagePayload {
                attempt_id,
                message: vec![0xde, 0xad],
                signer_ids: vec![1, 2],
                backend_id: "frost-secp256k1".into(),
            }),
            Payload::Round1Commitment(Round1CommitmentPayload {
                attempt_id,
                commitment: commitment(1),
            }),
            commitments_set(attempt_id, None),
            Payload::Abort(AbortPayload::new(AbortReason::Timeout, None)),
        ];

        for payload in payloads {
            let value = envelope(session_id, payload).to_value().unwrap();
            let mut ctx = ValidationContext::new(session_id, &mut dedup);
            assert!(run(&value, &mut ctx).is_ok());
        }
    }

    #[test]
    fn test_freshness_boundaries() {
        let session_id = Uuid::new_v4();
        let mut dedup = DedupSet::new();
        let freshness = Some(Freshness::at(NOW));
        let attempt = Uuid::new_v4();

        let cases = [
            (NOW - Freshness::DEFAULT_MAX_AGE_MS, None),
            (NOW - Freshness::DEFAULT_MAX_AGE_MS - 1, Some(ValidationErrorCode::MessageTooOld)),
            (NOW + Freshness::DEFAULT_MAX_SKEW_MS, None),
            (NOW + Freshness::DEFAULT_MAX_SKEW_MS + 1, Some(ValidationErrorCode::MessageFromFuture)),
        ];

        for (timestamp, expected) in cases {
            let value = share_envelope(session_id, attempt)
                .with_timestamp(timestamp)
                .to_value()
                .unwrap();
            let mut ctx = ValidationContext::new(session_id, &mut dedup).freshness(freshness);
            let result = run(&value, &mut ctx);
            match expected {
                None => assert!(result.is_ok(), "timestamp {} should pass", timestamp),
                Some(code) => assert_eq!(code_of(result), code),
            }
        }
    }

    #[test]
    fn test_session_mismatch() {
        let mut dedup = DedupSet::new();
        let value = share_envelope(Uuid::new_v4(), Uuid::new_v4()).to_value().unwrap();
        let mut ctx = ValidationContext::new(Uuid::new_v4(), &mut dedup);
        assert_eq!(code_of(run(&value, &mut ctx)), ValidationErrorCode::SessionMismatch);
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_out_of_phase_message_can_be_retried() {
        let session_id = Uuid::new_v4();
        let attempt = Uuid::new_v4();
        let mut dedup = DedupSet::new();
        let value = share_envelope(session_id, attempt).to_value().unwrap();

        let mut ctx = ValidationContext::new(session_id, &mut dedup).phase(ProtocolPhase::Round1);
        let err = run(&value, &mut ctx).unwrap_err();
        assert_eq!(err.code, ValidationErrorCode::MonotonicityViolation);
        assert!(err.is_retryable());

        let mut ctx = ValidationContext::new(session_id, &mut dedup)
            .phase(ProtocolPhase::CommitmentsSent)
            .attempt(Some(attempt));
        assert!(run(&value, &mut ctx).is_ok());
    }

    #[test]
    fn test_phase_table() {
        assert!(ProtocolPhase::Idle.allows(MessageType::SigningPackage));
        assert!(ProtocolPhase::Round2.allows(MessageType::Abort));
        assert!(!ProtocolPhase::Round1.allows(MessageType::Round2SignatureShare));
        assert!(ProtocolPhase::Round2.allows(MessageType::Round2SignatureShare));
        assert!(!ProtocolPhase::Idle.allows(MessageType::CommitmentsSet));
        assert!(!ProtocolPhase::Complete.allows(MessageType::SignatureResult));
    }

    #[test]
    fn test_attempt_mismatch() {
        let session_id = Uuid::new_v4();
        let mut dedup = DedupSet::new();
        let value = share_envelope(session_id, Uuid::new_v4()).to_value().unwrap();
        let mut ctx = ValidationContext::new(session_id, &mut dedup).attempt(Some(Uuid::new_v4()));
        let err = run(&value, &mut ctx).unwrap_err();
        assert_eq!(err.code, ValidationErrorCode::MessageIdMismatch);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_signing_package_skips_attempt_linkage() {
        let session_id = Uuid::new_v4();
        let mut dedup = DedupSet::new();
        let value = envelope(
            session_id,
            Payload::SigningPackage(SigningPackagePayload {
                attempt_id: Uuid::new_v4(),
                message: vec![1],
                signer_ids: vec![1, 2],
                backend_id: "frost-secp256k1".into(),
            }),
        )
        .to_value()
        .unwrap();
        let mut ctx = ValidationContext::new(session_id, &mut dedup)
            .attempt(Some(Uuid::new_v4()))
            .backend("frost-secp256k1", false);
        assert!(run(&value, &mut ctx).is_ok());
    }

    #[test]
    fn test_missing_randomizer() {
        let session_id = Uuid::new_v4();
        let attempt = Uuid::new_v4();
        let mut dedup = DedupSet::new();

        let without = envelope(session_id, commitments_set(attempt, None)).to_value().unwrap();
        let mut ctx = ValidationContext::new(session_id, &mut dedup)
            .backend("frost-secp256k1-rerandomized", true);
        assert_eq!(code_of(run(&without, &mut ctx)), ValidationErrorCode::MissingRandomizer);

        let with = envelope(session_id, commitments_set(attempt, Some(vec![5; 32])))
            .to_value()
            .unwrap();
        let mut ctx = ValidationContext::new(session_id, &mut dedup)
            .backend("frost-secp256k1-rerandomized", true);
        assert!(run(&with, &mut ctx).is_ok());
    }

    #[test]
    fn test_duplicate_commitments_rejected() {
        let session_id = Uuid::new_v4();
        let mut dedup = DedupSet::new();
        let payload = Payload::CommitmentsSet(CommitmentsSetPayload {
            attempt_id: Uuid::new_v4(),
            commitments: vec![commitment(1), commitment(1)],
            signing_package: vec![1],
            randomizer: None,
            group_public_key: vec![2],
        });
        let value = envelope(session_id, payload).to_value().unwrap();
        let mut ctx = ValidationContext::new(session_id, &mut dedup);
        assert_eq!(code_of(run(&value, &mut ctx)), ValidationErrorCode::DuplicateParticipant);
    }

    #[test]
    fn test_backend_mismatch() {
        let session_id = Uuid::new_v4();
        let mut dedup = DedupSet::new();
        let value = envelope(
            session_id,
            Payload::SigningPackage(SigningPackagePayload {
                attempt_id: Uuid::new_v4(),
                message: vec![1],
                signer_ids: vec![1, 2],
                backend_id: "frost-secp256k1-rerandomized".into(),
            }),
        )
        .to_value()
        .unwrap();
        let mut ctx =
            ValidationContext::new(session_id, &mut dedup).backend("frost-secp256k1", false);
        assert_eq!(code_of(run(&value, &mut ctx)), ValidationErrorCode::BackendMismatch);
    }

    #[test]
    fn test_structural_failures_not_recorded() {
        let session_id = Uuid::new_v4();
        let mut dedup = DedupSet::new();
        let good = share_envelope(session_id, Uuid::new_v4()).to_value().unwrap();

        let mutations: Vec<(&str, Value, ValidationErrorCode)> = vec![
            ("protocolVersion", json!(2), ValidationErrorCode::UnsupportedVersion),
            ("sessionId", json!("not-a-uuid"), ValidationErrorCode::InvalidSessionId),
            ("messageId", json!(42), ValidationErrorCode::InvalidMessageId),
            ("senderPublicKey", json!("abcd"), ValidationErrorCode::InvalidPublicKey),
            ("timestamp", json!("yesterday"), ValidationErrorCode::InvalidTimestamp),
            ("type", json!("ROUND3"), ValidationErrorCode::UnknownMessageType),
            ("payload", Value::Null, ValidationErrorCode::MissingPayload),
        ];

        for (field, replacement, expected) in mutations {
            let mut value = good.clone();
            value[field] = replacement;
            let mut ctx = ValidationContext::new(session_id, &mut dedup);
            let err = run(&value, &mut ctx).unwrap_err();
            assert_eq!(err.code, expected, "field {}", field);
            assert!(err.is_retryable());
        }
        assert!(dedup.is_empty());

        // the untouched envelope is still accepted
        let mut ctx = ValidationContext::new(session_id, &mut dedup);
        assert!(run(&good, &mut ctx).is_ok());
    }

    #[test]
    fn test_malformed_json() {
        let mut dedup = DedupSet::new();
        let mut ctx = ValidationContext::new(Uuid::new_v4(), &mut dedup);
        assert_eq!(
            code_of(validate(b"{not json", &mut ctx)),
            ValidationErrorCode::InvalidEnvelope
        );
    }

    #[test]
    fn test_error_serializes_as_triple() {
        let err = ValidationError::new(ValidationErrorCode::MessageTooOld, "stale")
            .with_details(json!({ "ageMs": 1 }));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "MessageTooOld");
        assert_eq!(value["message"], "stale");
        assert_eq!(value["details"]["ageMs"], 1);
    }
}
