//! Participant state machine
//!
//! ```text
//! idle -> ready -> awaitSigning -> round1 -> sendingCommitment -> awaitCommitments
//!      -> confirm -> round2 -> sendingShare -> awaitResult -> complete
//!
//! any state after ready -> aborting -> failed
//! ```
//!
//! Like the coordinator, the machine never performs I/O. Backend calls,
//! sends and the operator approval prompt are effects run by the
//! orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{decode_signing_package, SigningContext, SigningNonces};
use crate::config::CeremonyConfig;
use crate::error::{CeremonyError, CeremonyErrorCode};
use crate::message::{
    AbortPayload, AbortReason, CommitmentsSetPayload, Envelope, Payload,
    Round1CommitmentPayload, Round2SignatureSharePayload, SignatureResultPayload,
    SigningPackagePayload,
};
use crate::types::{
    Commitment, MessageId, ParticipantId, PeerKey, SessionId, SignatureShare, TimerId, TimerKind,
};
use crate::validation::{
    self, DedupSet, Freshness, NonceTracker, ProtocolPhase, ValidationContext, ValidationError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParticipantState {
    Idle,
    Ready,
    AwaitSigning,
    Round1,
    SendingCommitment,
    AwaitCommitments,
    Confirm,
    Round2,
    SendingShare,
    AwaitResult,
    Complete,
    Aborting,
    Failed,
}

impl ParticipantState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantState::Idle => "idle",
            ParticipantState::Ready => "ready",
            ParticipantState::AwaitSigning => "awaitSigning",
            ParticipantState::Round1 => "round1",
            ParticipantState::SendingCommitment => "sendingCommitment",
            ParticipantState::AwaitCommitments => "awaitCommitments",
            ParticipantState::Confirm => "confirm",
            ParticipantState::Round2 => "round2",
            ParticipantState::SendingShare => "sendingShare",
            ParticipantState::AwaitResult => "awaitResult",
            ParticipantState::Complete => "complete",
            ParticipantState::Aborting => "aborting",
            ParticipantState::Failed => "failed",
        }
    }

    pub fn phase(&self) -> ProtocolPhase {
        match self {
            ParticipantState::Round1
            | ParticipantState::SendingCommitment
            | ParticipantState::AwaitCommitments => ProtocolPhase::Round1,
            ParticipantState::Confirm => ProtocolPhase::CommitmentsSent,
            ParticipantState::Round2
            | ParticipantState::SendingShare
            | ParticipantState::AwaitResult => ProtocolPhase::Round2,
            ParticipantState::Complete => ProtocolPhase::Complete,
            _ => ProtocolPhase::Idle,
        }
    }

    /// States in which the participant is listening on a session
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ParticipantState::AwaitSigning
                | ParticipantState::Round1
                | ParticipantState::SendingCommitment
                | ParticipantState::AwaitCommitments
                | ParticipantState::Confirm
                | ParticipantState::Round2
                | ParticipantState::SendingShare
                | ParticipantState::AwaitResult
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ParticipantState::Complete | ParticipantState::Failed)
    }
}

impl fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a participant asks its operator to approve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub session_id: SessionId,
    pub attempt_id: MessageId,
    pub message: Vec<u8>,
    pub signer_ids: Vec<ParticipantId>,
    pub coordinator: PeerKey,
}

/// Outbound message kinds, echoed back in `SendFinished`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyPurpose {
    Commitment,
    Share,
    Abort,
}

#[derive(Debug)]
pub enum ParticipantEvent {
    Join {
        session_id: SessionId,
        coordinator: PeerKey,
    },
    StartListening,
    SigningPackageReceived {
        sender: PeerKey,
        payload: SigningPackagePayload,
    },
    Round1Generated {
        attempt_id: MessageId,
        nonces: SigningNonces,
        commitment: Commitment,
    },
    Round1Failed {
        attempt_id: MessageId,
        reason: String,
    },
    CommitmentsSetReceived {
        sender: PeerKey,
        payload: CommitmentsSetPayload,
    },
    Approve,
    Reject,
    ShareGenerated {
        attempt_id: MessageId,
        share: SignatureShare,
    },
    ShareFailed {
        attempt_id: MessageId,
        reason: String,
    },
    SendFinished {
        purpose: ReplyPurpose,
        error: Option<String>,
    },
    ResultReceived {
        sender: PeerKey,
        payload: SignatureResultPayload,
    },
    AbortReceived {
        sender: PeerKey,
        reason: AbortReason,
        message: Option<String>,
    },
    Cancel,
    Reset,
    TimerFired(TimerId),
}

#[derive(Debug)]
pub enum ParticipantEffect {
    StartPolling {
        session_id: SessionId,
    },
    StopPolling,
    GenerateRound1 {
        attempt_id: MessageId,
    },
    Send {
        purpose: ReplyPurpose,
        recipient: PeerKey,
        payload: Payload,
    },
    RequestApproval(ApprovalRequest),
    GenerateShare {
        attempt_id: MessageId,
        nonces: SigningNonces,
        context: SigningContext,
    },
    StartTimer {
        timer: TimerId,
        duration: Duration,
    },
    CancelTimer(TimerKind),
}

type Effects = Vec<ParticipantEffect>;

/// Data of the attempt the participant is currently signing
#[derive(Debug)]
struct ParticipantAttempt {
    attempt_id: MessageId,
    message: Vec<u8>,
    signer_ids: Vec<ParticipantId>,
    commitment: Option<Commitment>,
    nonces: Option<SigningNonces>,
    commitments_set: Option<CommitmentsSetPayload>,
    signature: Option<Vec<u8>>,
    verified: bool,
}

/// Participant side of one ceremony
pub struct ParticipantMachine {
    identity: PeerKey,
    participant_id: ParticipantId,
    backend_id: String,
    requires_randomizer: bool,
    config: CeremonyConfig,
    state: ParticipantState,
    session_id: Option<SessionId>,
    coordinator: Option<PeerKey>,
    attempt: Option<ParticipantAttempt>,
    nonce_tracker: NonceTracker,
    dedup: DedupSet,
    error: Option<CeremonyError>,
    last_error: Option<CeremonyError>,
    abort_reason: Option<AbortReason>,
    timer_epoch: u64,
    round_timer: Option<TimerId>,
}

impl ParticipantMachine {
    pub fn new(
        identity: PeerKey,
        participant_id: ParticipantId,
        backend_id: impl Into<String>,
        requires_randomizer: bool,
        config: CeremonyConfig,
    ) -> Self {
        let dedup = DedupSet::with_capacity(config.dedup_capacity);
        Self {
            identity,
            participant_id,
            backend_id: backend_id.into(),
            requires_randomizer,
            config,
            state: ParticipantState::Idle,
            session_id: None,
            coordinator: None,
            attempt: None,
            nonce_tracker: NonceTracker::new(),
            dedup,
            error: None,
            last_error: None,
            abort_reason: None,
            timer_epoch: 0,
            round_timer: None,
        }
    }

    pub fn identity(&self) -> PeerKey {
        self.identity
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    pub fn state(&self) -> ParticipantState {
        self.state
    }

    pub fn phase(&self) -> ProtocolPhase {
        self.state.phase()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn coordinator(&self) -> Option<PeerKey> {
        self.coordinator
    }

    pub fn attempt_id(&self) -> Option<MessageId> {
        self.attempt.as_ref().map(|a| a.attempt_id)
    }

    pub fn error(&self) -> Option<&CeremonyError> {
        self.error.as_ref()
    }

    pub fn last_error(&self) -> Option<&CeremonyError> {
        self.last_error.as_ref()
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort_reason
    }

    /// Commitment this participant generated for the current attempt
    pub fn commitment(&self) -> Option<&Commitment> {
        self.attempt.as_ref()?.commitment.as_ref()
    }

    /// Final signature reported by the coordinator and its verification flag
    pub fn signature(&self) -> Option<(&[u8], bool)> {
        let attempt = self.attempt.as_ref()?;
        attempt
            .signature
            .as_deref()
            .map(|signature| (signature, attempt.verified))
    }

    pub fn validate_inbound(
        &mut self,
        raw: &[u8],
        freshness: Option<Freshness>,
    ) -> std::result::Result<Envelope, ValidationError> {
        let session_id = self.session_id.unwrap_or_else(Uuid::nil);
        let phase = self.phase();
        let attempt_id = self.attempt_id();
        let mut ctx = ValidationContext::new(session_id, &mut self.dedup)
            .attempt(attempt_id)
            .backend(&self.backend_id, self.requires_randomizer)
            .phase(phase)
            .freshness(freshness);
        validation::validate(raw, &mut ctx)
    }

    pub fn inbound_event(envelope: Envelope) -> Option<ParticipantEvent> {
        let sender = envelope.sender_public_key;
        match envelope.payload {
            Payload::SigningPackage(payload) => {
                Some(ParticipantEvent::SigningPackageReceived { sender, payload })
            }
            Payload::CommitmentsSet(payload) => {
                Some(ParticipantEvent::CommitmentsSetReceived { sender, payload })
            }
            Payload::SignatureResult(payload) => {
                Some(ParticipantEvent::ResultReceived { sender, payload })
            }
            Payload::Abort(p) => Some(ParticipantEvent::AbortReceived {
                sender,
                reason: p.reason,
                message: p.message,
            }),
            other => {
                debug!(message_type = %other.message_type(), "Participant ignores message type");
                None
            }
        }
    }

    pub fn step(&mut self, event: ParticipantEvent) -> Effects {
        let mut fx = Vec::new();
        let before = self.state;

        match event {
            ParticipantEvent::Join {
                session_id,
                coordinator,
            } => {
                if self.state == ParticipantState::Idle {
                    self.session_id = Some(session_id);
                    self.coordinator = Some(coordinator);
                    self.enter(ParticipantState::Ready, &mut fx);
                }
            }
            ParticipantEvent::StartListening => {
                if let (ParticipantState::Ready, Some(session_id)) = (self.state, self.session_id)
                {
                    self.enter(ParticipantState::AwaitSigning, &mut fx);
                    fx.push(ParticipantEffect::StartPolling { session_id });
                }
            }
            ParticipantEvent::SigningPackageReceived { sender, payload } => {
                self.on_signing_package(sender, payload, &mut fx)
            }
            ParticipantEvent::Round1Generated {
                attempt_id,
                nonces,
                commitment,
            } => self.on_round1_generated(attempt_id, nonces, commitment, &mut fx),
            ParticipantEvent::Round1Failed { attempt_id, reason } => {
                if self.state == ParticipantState::Round1 && self.is_current(attempt_id) {
                    self.fail(
                        CeremonyErrorCode::SigningFailed,
                        format!("nonce generation: {}", reason),
                        Some(AbortReason::ProtocolError),
                        &mut fx,
                    );
                }
            }
            ParticipantEvent::CommitmentsSetReceived { sender, payload } => {
                self.on_commitments_set(sender, payload, &mut fx)
            }
            ParticipantEvent::Approve => self.on_approve(&mut fx),
            ParticipantEvent::Reject => {
                if self.state == ParticipantState::Confirm {
                    info!("Operator rejected the message");
                    self.begin_abort(
                        AbortReason::UserCancelled,
                        CeremonyError::new(CeremonyErrorCode::Aborted, "signing rejected by operator"),
                        &mut fx,
                    );
                }
            }
            ParticipantEvent::ShareGenerated { attempt_id, share } => {
                self.on_share_generated(attempt_id, share, &mut fx)
            }
            ParticipantEvent::ShareFailed { attempt_id, reason } => {
                if self.state == ParticipantState::Round2 && self.is_current(attempt_id) {
                    self.fail(
                        CeremonyErrorCode::SigningFailed,
                        format!("partial signature: {}", reason),
                        Some(AbortReason::InvalidShare),
                        &mut fx,
                    );
                }
            }
            ParticipantEvent::SendFinished { purpose, error } => {
                self.on_send_finished(purpose, error, &mut fx)
            }
            ParticipantEvent::ResultReceived { sender, payload } => {
                self.on_result(sender, payload, &mut fx)
            }
            ParticipantEvent::AbortReceived {
                sender,
                reason,
                message,
            } => self.on_abort_received(sender, reason, message, &mut fx),
            ParticipantEvent::Cancel => match self.state {
                ParticipantState::Idle | ParticipantState::Ready => self.reset(&mut fx),
                state if state.is_active() => self.begin_abort(
                    AbortReason::UserCancelled,
                    CeremonyError::new(CeremonyErrorCode::Aborted, "cancelled by operator"),
                    &mut fx,
                ),
                _ => {}
            },
            ParticipantEvent::Reset => {
                if self.state != ParticipantState::Aborting {
                    self.reset(&mut fx);
                }
            }
            ParticipantEvent::TimerFired(timer) => self.on_timer(timer, &mut fx),
        }

        if self.state != before {
            debug!(
                participant_id = self.participant_id,
                from = %before,
                to = %self.state,
                "Participant transition"
            );
        }
        fx
    }

    fn is_current(&self, attempt_id: MessageId) -> bool {
        self.attempt_id() == Some(attempt_id)
    }

    fn from_coordinator(&self, sender: &PeerKey) -> bool {
        self.coordinator.as_ref() == Some(sender)
    }

    fn on_signing_package(
        &mut self,
        sender: PeerKey,
        payload: SigningPackagePayload,
        fx: &mut Effects,
    ) {
        let accepts = self.state.is_active() || self.state == ParticipantState::Complete;
        if !accepts {
            debug!(state = %self.state, "Signing package ignored");
            return;
        }
        if !self.from_coordinator(&sender) {
            warn!("Signing package from a peer other than the coordinator ignored");
            return;
        }

        let attempt_id = payload.attempt_id;
        if !self
            .nonce_tracker
            .record_nonce_usage(self.participant_id, attempt_id)
        {
            self.fail(
                CeremonyErrorCode::NonceReuseDetected,
                format!("signing attempt {} was already seen", attempt_id),
                None,
                fx,
            );
            return;
        }
        if payload.backend_id != self.backend_id {
            self.fail(
                CeremonyErrorCode::InvalidMessage,
                format!("coordinator uses backend `{}`", payload.backend_id),
                Some(AbortReason::BackendMismatch),
                fx,
            );
            return;
        }
        if !payload.signer_ids.contains(&self.participant_id) {
            debug!(%attempt_id, "Not selected for this attempt");
            return;
        }

        if let Some(previous) = self.attempt_id() {
            if self.state != ParticipantState::Complete {
                warn!(%previous, %attempt_id, "New signing package replaces the running attempt");
            }
        }
        info!(
            %attempt_id,
            signers = ?payload.signer_ids,
            message_len = payload.message.len(),
            "Signing package received"
        );
        self.error = None;
        self.abort_reason = None;
        self.attempt = Some(ParticipantAttempt {
            attempt_id,
            message: payload.message,
            signer_ids: payload.signer_ids,
            commitment: None,
            nonces: None,
            commitments_set: None,
            signature: None,
            verified: false,
        });
        self.enter(ParticipantState::Round1, fx);
        fx.push(ParticipantEffect::GenerateRound1 { attempt_id });
    }

    fn on_round1_generated(
        &mut self,
        attempt_id: MessageId,
        nonces: SigningNonces,
        commitment: Commitment,
        fx: &mut Effects,
    ) {
        if self.state != ParticipantState::Round1 || !self.is_current(attempt_id) {
            debug!(%attempt_id, "Discarding nonces of a stale attempt");
            return;
        }
        let (Some(coordinator), Some(attempt)) = (self.coordinator, self.attempt.as_mut()) else {
            return;
        };
        attempt.nonces = Some(nonces);
        attempt.commitment = Some(commitment.clone());
        let payload = Payload::Round1Commitment(Round1CommitmentPayload {
            attempt_id,
            commitment,
        });

        self.enter(ParticipantState::SendingCommitment, fx);
        fx.push(ParticipantEffect::Send {
            purpose: ReplyPurpose::Commitment,
            recipient: coordinator,
            payload,
        });
    }

    /// Check an echoed commitment set against local state
    fn check_commitments_set(&self, payload: &CommitmentsSetPayload) -> Result<(), String> {
        let attempt = self
            .attempt
            .as_ref()
            .ok_or_else(|| "no signing attempt in progress".to_string())?;
        let echoed = payload
            .commitment_of(self.participant_id)
            .ok_or_else(|| "own commitment missing from the set".to_string())?;
        if let Some(local) = &attempt.commitment {
            if local != echoed {
                return Err("echoed commitment differs from the local one".into());
            }
        }

        let bundle = decode_signing_package(&payload.signing_package).map_err(|e| e.to_string())?;
        if bundle.message != attempt.message {
            return Err("signing package is for a different message".into());
        }
        if self.requires_randomizer && payload.randomizer.is_none() {
            return Err("randomizer missing".into());
        }
        Ok(())
    }

    fn on_commitments_set(
        &mut self,
        sender: PeerKey,
        payload: CommitmentsSetPayload,
        fx: &mut Effects,
    ) {
        if !matches!(
            self.state,
            ParticipantState::SendingCommitment | ParticipantState::AwaitCommitments
        ) {
            debug!(state = %self.state, "Commitments set ignored");
            return;
        }
        if !self.from_coordinator(&sender) || !self.is_current(payload.attempt_id) {
            warn!("Commitments set from wrong sender or attempt ignored");
            return;
        }
        if let Err(reason) = self.check_commitments_set(&payload) {
            self.fail(
                CeremonyErrorCode::InvalidCommitment,
                reason,
                Some(AbortReason::InvalidCommitment),
                fx,
            );
            return;
        }

        let (Some(session_id), Some(coordinator), Some(attempt)) =
            (self.session_id, self.coordinator, self.attempt.as_mut())
        else {
            return;
        };
        let request = ApprovalRequest {
            session_id,
            attempt_id: attempt.attempt_id,
            message: attempt.message.clone(),
            signer_ids: payload.commitments.iter().map(|c| c.participant_id).collect(),
            coordinator,
        };
        debug!(
            commitments = payload.commitments.len(),
            original_signers = ?attempt.signer_ids,
            "Commitments set accepted"
        );
        attempt.commitments_set = Some(payload);

        self.enter(ParticipantState::Confirm, fx);
        fx.push(ParticipantEffect::RequestApproval(request));
    }

    fn on_approve(&mut self, fx: &mut Effects) {
        if self.state != ParticipantState::Confirm {
            return;
        }
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        let attempt_id = attempt.attempt_id;
        let nonces = attempt.nonces.take();
        let context = attempt.commitments_set.as_ref().map(|set| SigningContext {
            message: attempt.message.clone(),
            commitments: set.commitments.clone(),
            signing_package: set.signing_package.clone(),
            randomizer: set.randomizer.clone(),
            group_public_key: set.group_public_key.clone(),
        });
        let (Some(nonces), Some(context)) = (nonces, context) else {
            self.fail(
                CeremonyErrorCode::SigningFailed,
                "nonces already consumed",
                Some(AbortReason::ProtocolError),
                fx,
            );
            return;
        };

        info!(%attempt_id, "Operator approved the message");
        self.enter(ParticipantState::Round2, fx);
        fx.push(ParticipantEffect::GenerateShare {
            attempt_id,
            nonces,
            context,
        });
    }

    fn on_share_generated(&mut self, attempt_id: MessageId, share: SignatureShare, fx: &mut Effects) {
        if self.state != ParticipantState::Round2 || !self.is_current(attempt_id) {
            return;
        }
        let Some(coordinator) = self.coordinator else {
            return;
        };
        if share.participant_id != self.participant_id {
            self.fail(
                CeremonyErrorCode::SigningFailed,
                "backend produced a share for another participant",
                Some(AbortReason::InvalidShare),
                fx,
            );
            return;
        }
        let payload = Payload::Round2SignatureShare(Round2SignatureSharePayload { attempt_id, share });
        self.enter(ParticipantState::SendingShare, fx);
        fx.push(ParticipantEffect::Send {
            purpose: ReplyPurpose::Share,
            recipient: coordinator,
            payload,
        });
    }

    fn on_send_finished(&mut self, purpose: ReplyPurpose, error: Option<String>, fx: &mut Effects) {
        match (purpose, self.state) {
            // an undelivered reply is settled by the round timer or a coordinator abort
            (ReplyPurpose::Commitment, ParticipantState::SendingCommitment) => {
                if let Some(error) = error {
                    warn!(%error, "Commitment not delivered");
                }
                self.enter(ParticipantState::AwaitCommitments, fx);
            }
            (ReplyPurpose::Share, ParticipantState::SendingShare) => {
                if let Some(error) = error {
                    warn!(%error, "Signature share not delivered");
                }
                self.enter(ParticipantState::AwaitResult, fx);
            }
            (ReplyPurpose::Abort, ParticipantState::Aborting) => {
                if let Some(error) = error {
                    warn!(%error, "Abort not delivered");
                }
                self.enter(ParticipantState::Failed, fx);
                fx.push(ParticipantEffect::StopPolling);
            }
            (purpose, state) => {
                if let Some(error) = error {
                    warn!(?purpose, %state, %error, "Late send failure ignored");
                }
            }
        }
    }

    fn on_result(&mut self, sender: PeerKey, payload: SignatureResultPayload, fx: &mut Effects) {
        if !matches!(
            self.state,
            ParticipantState::SendingShare | ParticipantState::AwaitResult
        ) {
            debug!(state = %self.state, "Signature result ignored");
            return;
        }
        if !self.from_coordinator(&sender) || !self.is_current(payload.attempt_id) {
            warn!("Signature result from wrong sender or attempt ignored");
            return;
        }
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if !payload.verified {
            warn!(attempt_id = %payload.attempt_id, "Coordinator reports an unverified signature");
        }
        attempt.signature = Some(payload.signature);
        attempt.verified = payload.verified;

        self.enter(ParticipantState::Complete, fx);
        fx.push(ParticipantEffect::StopPolling);
    }

    fn on_abort_received(
        &mut self,
        sender: PeerKey,
        reason: AbortReason,
        message: Option<String>,
        fx: &mut Effects,
    ) {
        if !self.state.is_active() {
            return;
        }
        if !self.from_coordinator(&sender) {
            warn!(%reason, "Abort from a peer other than the coordinator ignored");
            return;
        }
        let detail = match message {
            Some(text) => format!("coordinator aborted ({}): {}", reason, text),
            None => format!("coordinator aborted ({})", reason),
        };
        warn!(%reason, "Ceremony aborted by coordinator");
        self.record_error(CeremonyError::new(CeremonyErrorCode::Aborted, detail));
        self.abort_reason = Some(reason);
        self.drop_nonces();
        self.enter(ParticipantState::Failed, fx);
        fx.push(ParticipantEffect::StopPolling);
    }

    fn on_timer(&mut self, timer: TimerId, fx: &mut Effects) {
        if self.round_timer != Some(timer) {
            debug!(?timer, "Stale timer ignored");
            return;
        }
        self.round_timer = None;
        match self.state {
            ParticipantState::AwaitCommitments => self.fail(
                CeremonyErrorCode::Round1Timeout,
                "no commitments set received",
                Some(AbortReason::Timeout),
                fx,
            ),
            ParticipantState::AwaitResult => self.fail(
                CeremonyErrorCode::ResultTimeout,
                "no signature result received",
                Some(AbortReason::Timeout),
                fx,
            ),
            _ => {}
        }
    }

    fn drop_nonces(&mut self) {
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.nonces = None;
        }
    }

    fn abort_effect(&self, reason: AbortReason, message: &str) -> Option<ParticipantEffect> {
        let coordinator = self.coordinator?;
        let payload = AbortPayload::new(reason, self.attempt_id()).with_message(message);
        Some(ParticipantEffect::Send {
            purpose: ReplyPurpose::Abort,
            recipient: coordinator,
            payload: Payload::Abort(payload),
        })
    }

    fn begin_abort(&mut self, reason: AbortReason, error: CeremonyError, fx: &mut Effects) {
        self.abort_reason = Some(reason);
        let effect = self.abort_effect(reason, &error.message);
        self.record_error(error);
        self.drop_nonces();
        self.enter(ParticipantState::Aborting, fx);
        match effect {
            Some(effect) => fx.push(effect),
            None => {
                self.enter(ParticipantState::Failed, fx);
                fx.push(ParticipantEffect::StopPolling);
            }
        }
    }

    fn record_error(&mut self, error: CeremonyError) {
        self.last_error = Some(error.clone());
        self.error = Some(error);
    }

    fn fail(
        &mut self,
        code: CeremonyErrorCode,
        message: impl Into<String>,
        abort: Option<AbortReason>,
        fx: &mut Effects,
    ) {
        let error = CeremonyError::new(code, message);
        warn!(participant_id = self.participant_id, error = %error, "Participant failed");
        if let Some(reason) = abort {
            self.abort_reason = Some(reason);
            if let Some(effect) = self.abort_effect(reason, &error.message) {
                fx.push(effect);
            }
        }
        self.record_error(error);
        self.drop_nonces();
        self.enter(ParticipantState::Failed, fx);
        fx.push(ParticipantEffect::StopPolling);
    }

    /// Back to a fresh idle machine; nonce history is kept
    fn reset(&mut self, fx: &mut Effects) {
        if self.state.is_active() {
            fx.push(ParticipantEffect::StopPolling);
        }
        if self.round_timer.take().is_some() {
            fx.push(ParticipantEffect::CancelTimer(TimerKind::Round));
        }
        self.state = ParticipantState::Idle;
        if let Some(session_id) = self.session_id.take() {
            self.dedup.clear_session(session_id);
        }
        self.coordinator = None;
        self.attempt = None;
        self.error = None;
        self.abort_reason = None;
    }

    fn enter(&mut self, next: ParticipantState, fx: &mut Effects) {
        if self.round_timer.take().is_some() {
            fx.push(ParticipantEffect::CancelTimer(TimerKind::Round));
        }
        self.state = next;

        let timeout = match next {
            ParticipantState::AwaitCommitments => Some(self.config.round1_timeout),
            ParticipantState::AwaitResult => Some(self.config.result_timeout),
            _ => None,
        };
        if let Some(duration) = timeout {
            self.timer_epoch += 1;
            let timer = TimerId {
                kind: TimerKind::Round,
                epoch: self.timer_epoch,
            };
            self.round_timer = Some(timer);
            fx.push(ParticipantEffect::StartTimer { timer, duration });
        }
    }
}
