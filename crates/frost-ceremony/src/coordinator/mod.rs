//! Coordinator state machine
//!
//! The machine is a pure reducer: [`CoordinatorMachine::step`] consumes one
//! event and returns the side effects the orchestrator must perform. Results
//! of those effects come back as further events.
//!
//! ```text
//! idle -> creatingSession -> waiting -> round1Collect -> creatingSigningPackage
//!      -> round2Send -> round2Collect -> aggregating -> broadcasting -> complete
//!
//! any active state -> aborting -> closing -> idle
//! collecting/aggregating states -> failed
//! ```

mod attempt;

pub use attempt::SigningAttempt;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{backend_for, PublicKeyPackage, SigningContext};
use crate::config::CeremonyConfig;
use crate::error::{CeremonyError, CeremonyErrorCode};
use crate::message::{
    AbortPayload, AbortReason, CommitmentsSetPayload, Envelope, Payload, SignatureResultPayload,
    SigningPackagePayload,
};
use crate::types::{
    Commitment, MessageId, ParticipantId, PeerKey, Session, SessionId, SignatureShare, TimerId,
    TimerKind,
};
use crate::validation::{self, DedupSet, Freshness, ProtocolPhase, ValidationContext, ValidationError};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CoordinatorState {
    Idle,
    CreatingSession,
    Waiting,
    Round1Collect,
    CreatingSigningPackage,
    Round2Send,
    Round2Collect,
    Aggregating,
    Broadcasting,
    Complete,
    Aborting,
    Closing,
    Failed,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::CreatingSession => "creatingSession",
            CoordinatorState::Waiting => "waiting",
            CoordinatorState::Round1Collect => "round1Collect",
            CoordinatorState::CreatingSigningPackage => "creatingSigningPackage",
            CoordinatorState::Round2Send => "round2Send",
            CoordinatorState::Round2Collect => "round2Collect",
            CoordinatorState::Aggregating => "aggregating",
            CoordinatorState::Broadcasting => "broadcasting",
            CoordinatorState::Complete => "complete",
            CoordinatorState::Aborting => "aborting",
            CoordinatorState::Closing => "closing",
            CoordinatorState::Failed => "failed",
        }
    }

    /// Protocol phase used to validate inbound messages
    pub fn phase(&self) -> ProtocolPhase {
        match self {
            CoordinatorState::Round1Collect | CoordinatorState::CreatingSigningPackage => {
                ProtocolPhase::Round1
            }
            CoordinatorState::Round2Send => ProtocolPhase::CommitmentsSent,
            CoordinatorState::Round2Collect
            | CoordinatorState::Aggregating
            | CoordinatorState::Broadcasting => ProtocolPhase::Round2,
            CoordinatorState::Complete => ProtocolPhase::Complete,
            _ => ProtocolPhase::Idle,
        }
    }

    /// States in which a session is open and a ceremony may be aborted
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CoordinatorState::Waiting
                | CoordinatorState::Round1Collect
                | CoordinatorState::CreatingSigningPackage
                | CoordinatorState::Round2Send
                | CoordinatorState::Round2Collect
                | CoordinatorState::Aggregating
                | CoordinatorState::Broadcasting
        )
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator request to start a signing attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSigning {
    pub message: Vec<u8>,
    pub signer_ids: Vec<ParticipantId>,
    pub backend_id: String,
    pub requires_randomizer: bool,
    pub public_key_package: PublicKeyPackage,
    pub group_public_key: Vec<u8>,
}

impl StartSigning {
    /// Fill backend details from the key group
    pub fn new(
        message: Vec<u8>,
        signer_ids: Vec<ParticipantId>,
        public_key_package: PublicKeyPackage,
    ) -> Result<Self> {
        let backend = backend_for(&public_key_package.backend_id)?;
        Ok(Self {
            message,
            signer_ids,
            backend_id: backend.id().to_string(),
            requires_randomizer: backend.requires_randomizer(),
            group_public_key: public_key_package.group_public_key.clone(),
            public_key_package,
        })
    }
}

/// What an outbound message is for; echoed back in `SendFinished`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendPurpose {
    SigningPackage,
    CommitmentsSet,
    SignatureResult,
    Abort,
}

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    CreateSession {
        participant_keys: Vec<PeerKey>,
        threshold: u16,
    },
    SessionCreated {
        session_id: SessionId,
    },
    SessionCreationFailed {
        reason: String,
    },
    StartSigning(StartSigning),
    CommitmentReceived {
        sender: PeerKey,
        attempt_id: MessageId,
        commitment: Commitment,
    },
    SigningPackageBuilt {
        signing_package: Vec<u8>,
        randomizer: Option<Vec<u8>>,
    },
    SigningPackageFailed {
        reason: String,
    },
    ShareReceived {
        sender: PeerKey,
        attempt_id: MessageId,
        share: SignatureShare,
    },
    Aggregated {
        signature: Vec<u8>,
        verified: bool,
    },
    AggregationFailed {
        reason: String,
    },
    SendFinished {
        purpose: SendPurpose,
        error: Option<String>,
    },
    AbortReceived {
        sender: PeerKey,
        reason: AbortReason,
        message: Option<String>,
    },
    Cancel,
    SessionClosed {
        error: Option<String>,
    },
    Reset,
    TimerFired(TimerId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEffect {
    CreateSession {
        participant_keys: Vec<PeerKey>,
    },
    StartPolling {
        session_id: SessionId,
    },
    StopPolling,
    Send {
        purpose: SendPurpose,
        recipients: Vec<PeerKey>,
        payload: Payload,
    },
    BuildSigningPackage {
        backend_id: String,
        message: Vec<u8>,
        commitments: Vec<Commitment>,
        group_public_key: Vec<u8>,
    },
    Aggregate {
        backend_id: String,
        context: SigningContext,
        shares: Vec<SignatureShare>,
        public_key_package: PublicKeyPackage,
    },
    CloseSession {
        session_id: SessionId,
    },
    StartTimer {
        timer: TimerId,
        duration: Duration,
    },
    CancelTimer(TimerKind),
}

type Effects = Vec<CoordinatorEffect>;

/// Coordinator side of one ceremony session
pub struct CoordinatorMachine {
    identity: PeerKey,
    config: CeremonyConfig,
    state: CoordinatorState,
    session: Option<Session>,
    attempt: Option<SigningAttempt>,
    error: Option<CeremonyError>,
    last_error: Option<CeremonyError>,
    abort_reason: Option<AbortReason>,
    timer_epoch: u64,
    round_timer: Option<TimerId>,
    session_timer: Option<TimerId>,
    dedup: DedupSet,
}

impl CoordinatorMachine {
    pub fn new(identity: PeerKey, config: CeremonyConfig) -> Self {
        let dedup = DedupSet::with_capacity(config.dedup_capacity);
        Self {
            identity,
            config,
            state: CoordinatorState::Idle,
            session: None,
            attempt: None,
            error: None,
            last_error: None,
            abort_reason: None,
            timer_epoch: 0,
            round_timer: None,
            session_timer: None,
            dedup,
        }
    }

    pub fn identity(&self) -> PeerKey {
        self.identity
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn phase(&self) -> ProtocolPhase {
        self.state.phase()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn attempt(&self) -> Option<&SigningAttempt> {
        self.attempt.as_ref()
    }

    /// Error of the current ceremony; cleared on reset
    pub fn error(&self) -> Option<&CeremonyError> {
        self.error.as_ref()
    }

    /// Most recent error, kept across resets
    pub fn last_error(&self) -> Option<&CeremonyError> {
        self.last_error.as_ref()
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort_reason
    }

    /// Final signature and its verification flag
    pub fn signature(&self) -> Option<(&[u8], bool)> {
        let attempt = self.attempt.as_ref()?;
        attempt
            .signature
            .as_deref()
            .map(|signature| (signature, attempt.verified))
    }

    /// Validate raw inbound bytes against the current session and phase
    pub fn validate_inbound(
        &mut self,
        raw: &[u8],
        freshness: Option<Freshness>,
    ) -> std::result::Result<Envelope, ValidationError> {
        let session_id = self
            .session
            .as_ref()
            .map(|s| s.session_id)
            .unwrap_or_else(Uuid::nil);
        let phase = self.phase();
        let mut ctx = ValidationContext::new(session_id, &mut self.dedup)
            .phase(phase)
            .freshness(freshness);
        if let Some(attempt) = &self.attempt {
            ctx = ctx
                .attempt(Some(attempt.attempt_id))
                .backend(&attempt.backend_id, attempt.requires_randomizer);
        }
        validation::validate(raw, &mut ctx)
    }

    /// Map a validated envelope to the event it drives, if any
    pub fn inbound_event(envelope: Envelope) -> Option<CoordinatorEvent> {
        let sender = envelope.sender_public_key;
        match envelope.payload {
            Payload::Round1Commitment(p) => Some(CoordinatorEvent::CommitmentReceived {
                sender,
                attempt_id: p.attempt_id,
                commitment: p.commitment,
            }),
            Payload::Round2SignatureShare(p) => Some(CoordinatorEvent::ShareReceived {
                sender,
                attempt_id: p.attempt_id,
                share: p.share,
            }),
            Payload::Abort(p) => Some(CoordinatorEvent::AbortReceived {
                sender,
                reason: p.reason,
                message: p.message,
            }),
            other => {
                debug!(message_type = %other.message_type(), "Coordinator ignores message type");
                None
            }
        }
    }

    /// Process one event to completion
    pub fn step(&mut self, event: CoordinatorEvent) -> Effects {
        let mut fx = Vec::new();
        let before = self.state;

        match event {
            CoordinatorEvent::CreateSession {
                participant_keys,
                threshold,
            } => self.on_create_session(participant_keys, threshold, &mut fx),
            CoordinatorEvent::SessionCreated { session_id } => {
                self.on_session_created(session_id, &mut fx)
            }
            CoordinatorEvent::SessionCreationFailed { reason } => {
                if self.state == CoordinatorState::CreatingSession {
                    self.session = None;
                    self.fail(CeremonyErrorCode::SessionCreationFailed, reason, None, &mut fx);
                }
            }
            CoordinatorEvent::StartSigning(request) => self.on_start_signing(request, &mut fx),
            CoordinatorEvent::CommitmentReceived {
                sender,
                attempt_id,
                commitment,
            } => self.on_commitment(sender, attempt_id, commitment, &mut fx),
            CoordinatorEvent::SigningPackageBuilt {
                signing_package,
                randomizer,
            } => self.on_package_built(signing_package, randomizer, &mut fx),
            CoordinatorEvent::SigningPackageFailed { reason } => {
                if self.state == CoordinatorState::CreatingSigningPackage {
                    self.fail(
                        CeremonyErrorCode::AggregationFailed,
                        format!("signing package: {}", reason),
                        Some(AbortReason::AggregationFailed),
                        &mut fx,
                    );
                }
            }
            CoordinatorEvent::ShareReceived {
                sender,
                attempt_id,
                share,
            } => self.on_share(sender, attempt_id, share, &mut fx),
            CoordinatorEvent::Aggregated {
                signature,
                verified,
            } => self.on_aggregated(signature, verified, &mut fx),
            CoordinatorEvent::AggregationFailed { reason } => {
                if self.state == CoordinatorState::Aggregating {
                    self.fail(
                        CeremonyErrorCode::AggregationFailed,
                        reason,
                        Some(AbortReason::AggregationFailed),
                        &mut fx,
                    );
                }
            }
            CoordinatorEvent::SendFinished { purpose, error } => {
                self.on_send_finished(purpose, error, &mut fx)
            }
            CoordinatorEvent::AbortReceived {
                sender,
                reason,
                message,
            } => self.on_abort_received(sender, reason, message, &mut fx),
            CoordinatorEvent::Cancel => self.on_cancel(&mut fx),
            CoordinatorEvent::SessionClosed { error } => {
                if self.state == CoordinatorState::Closing {
                    if let Some(error) = error {
                        warn!(%error, "Session close failed, resetting anyway");
                    }
                    self.reset_to_idle(&mut fx);
                }
            }
            CoordinatorEvent::Reset => match self.state {
                CoordinatorState::Failed | CoordinatorState::Complete => self.begin_close(&mut fx),
                state if state.is_active() => self.on_cancel(&mut fx),
                _ => {}
            },
            CoordinatorEvent::TimerFired(timer) => self.on_timer(timer, &mut fx),
        }

        if self.state != before {
            debug!(from = %before, to = %self.state, "Coordinator transition");
        }
        fx
    }

    fn on_create_session(&mut self, participant_keys: Vec<PeerKey>, threshold: u16, fx: &mut Effects) {
        if self.state != CoordinatorState::Idle {
            warn!(state = %self.state, "CreateSession ignored outside idle");
            return;
        }

        match Session::new(Uuid::nil(), self.identity, participant_keys.clone(), threshold) {
            Ok(session) => {
                self.session = Some(session);
                self.error = None;
                self.state = CoordinatorState::CreatingSession;
                fx.push(CoordinatorEffect::CreateSession { participant_keys });
            }
            Err(e) => {
                self.fail(CeremonyErrorCode::SessionCreationFailed, e.to_string(), None, fx);
            }
        }
    }

    fn on_session_created(&mut self, session_id: SessionId, fx: &mut Effects) {
        if self.state != CoordinatorState::CreatingSession {
            warn!(%session_id, state = %self.state, "Late session creation result, releasing it");
            fx.push(CoordinatorEffect::CloseSession { session_id });
            return;
        }
        let Some(session) = self.session.as_mut() else {
            fx.push(CoordinatorEffect::CloseSession { session_id });
            return;
        };
        session.session_id = session_id;
        info!(
            %session_id,
            threshold = session.threshold,
            participants = session.total_participants,
            "Session created"
        );
        self.enter(CoordinatorState::Waiting, fx);
        fx.push(CoordinatorEffect::StartPolling { session_id });
    }

    fn check_start(&self, request: &StartSigning) -> std::result::Result<(), CeremonyError> {
        let invalid = |msg: String| CeremonyError::new(CeremonyErrorCode::InvalidMessage, msg);
        let Some(session) = &self.session else {
            return Err(invalid("no active session".into()));
        };

        if request.message.is_empty() {
            return Err(invalid("message to sign is empty".into()));
        }
        let backend = backend_for(&request.backend_id).map_err(|e| invalid(e.to_string()))?;
        if backend.requires_randomizer() != request.requires_randomizer {
            return Err(invalid(format!(
                "backend `{}` randomizer requirement mismatch",
                request.backend_id
            )));
        }
        if request.public_key_package.backend_id != request.backend_id
            || request.public_key_package.group_public_key != request.group_public_key
        {
            return Err(invalid("public key package does not match the request".into()));
        }

        let mut seen = HashSet::new();
        for id in &request.signer_ids {
            if !session.is_participant(*id) {
                return Err(invalid(format!("participant {} is not in the session", id)));
            }
            if !seen.insert(*id) {
                return Err(invalid(format!("participant {} selected twice", id)));
            }
        }
        if request.signer_ids.len() < usize::from(session.threshold) {
            return Err(CeremonyError::new(
                CeremonyErrorCode::ThresholdNotMet,
                format!(
                    "{} signers selected, threshold is {}",
                    request.signer_ids.len(),
                    session.threshold
                ),
            ));
        }
        Ok(())
    }

    fn on_start_signing(&mut self, request: StartSigning, fx: &mut Effects) {
        if self.state != CoordinatorState::Waiting {
            warn!(state = %self.state, "StartSigning ignored outside waiting");
            return;
        }
        if let Err(e) = self.check_start(&request) {
            warn!(error = %e, "Rejected signing request");
            self.last_error = Some(e);
            return;
        }
        let Some(session) = &self.session else {
            return;
        };

        let attempt_id = Uuid::new_v4();
        let payload = Payload::SigningPackage(SigningPackagePayload {
            attempt_id,
            message: request.message.clone(),
            signer_ids: request.signer_ids.clone(),
            backend_id: request.backend_id.clone(),
        });
        let recipients = session.participant_public_keys.clone();

        info!(
            %attempt_id,
            signers = ?request.signer_ids,
            backend = %request.backend_id,
            "Starting signing attempt"
        );

        self.error = None;
        self.abort_reason = None;
        self.attempt = Some(SigningAttempt::new(
            attempt_id,
            request.message,
            request.signer_ids,
            request.backend_id,
            request.requires_randomizer,
            request.public_key_package,
            request.group_public_key,
        ));
        self.enter(CoordinatorState::Round1Collect, fx);
        fx.push(CoordinatorEffect::Send {
            purpose: SendPurpose::SigningPackage,
            recipients,
            payload,
        });
    }

    /// Participant id bound to `sender`, if it matches `claimed`
    fn bound_sender(&self, sender: &PeerKey, claimed: ParticipantId) -> bool {
        self.session
            .as_ref()
            .and_then(|s| s.participant_id_of(sender))
            .is_some_and(|id| id == claimed)
    }

    fn current_attempt(&self, attempt_id: MessageId) -> bool {
        self.attempt
            .as_ref()
            .is_some_and(|a| a.attempt_id == attempt_id)
    }

    fn on_commitment(
        &mut self,
        sender: PeerKey,
        attempt_id: MessageId,
        commitment: Commitment,
        fx: &mut Effects,
    ) {
        if self.state != CoordinatorState::Round1Collect {
            debug!(state = %self.state, "Commitment ignored outside round1Collect");
            return;
        }
        let participant_id = commitment.participant_id;
        if !self.current_attempt(attempt_id) || !self.bound_sender(&sender, participant_id) {
            warn!(participant_id, "Commitment with foreign attempt or sender ignored");
            return;
        }
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if !attempt.record_commitment(commitment) {
            warn!(participant_id, "Commitment from unselected participant ignored");
            return;
        }
        debug!(
            participant_id,
            received = attempt.commitment_count(),
            expected = attempt.signer_ids.len(),
            "Commitment recorded"
        );
        if attempt.has_all_commitments() {
            self.begin_signing_package(fx);
        }
    }

    fn begin_signing_package(&mut self, fx: &mut Effects) {
        let Some(attempt) = &self.attempt else {
            return;
        };
        let effect = CoordinatorEffect::BuildSigningPackage {
            backend_id: attempt.backend_id.clone(),
            message: attempt.message.clone(),
            commitments: attempt.commitments(),
            group_public_key: attempt.group_public_key.clone(),
        };
        self.enter(CoordinatorState::CreatingSigningPackage, fx);
        fx.push(effect);
    }

    fn on_package_built(
        &mut self,
        signing_package: Vec<u8>,
        randomizer: Option<Vec<u8>>,
        fx: &mut Effects,
    ) {
        if self.state != CoordinatorState::CreatingSigningPackage {
            return;
        }
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if attempt.requires_randomizer && randomizer.is_none() {
            self.fail(
                CeremonyErrorCode::AggregationFailed,
                "backend produced no randomizer",
                Some(AbortReason::AggregationFailed),
                fx,
            );
            return;
        }

        attempt.signing_package = Some(signing_package.clone());
        attempt.randomizer = randomizer.clone();
        let payload = Payload::CommitmentsSet(CommitmentsSetPayload {
            attempt_id: attempt.attempt_id,
            commitments: attempt.commitments(),
            signing_package,
            randomizer,
            group_public_key: attempt.group_public_key.clone(),
        });
        let recipients = self.signer_keys();

        self.enter(CoordinatorState::Round2Send, fx);
        fx.push(CoordinatorEffect::Send {
            purpose: SendPurpose::CommitmentsSet,
            recipients,
            payload,
        });
    }

    fn on_share(
        &mut self,
        sender: PeerKey,
        attempt_id: MessageId,
        share: SignatureShare,
        fx: &mut Effects,
    ) {
        if !matches!(
            self.state,
            CoordinatorState::Round2Send | CoordinatorState::Round2Collect
        ) {
            debug!(state = %self.state, "Share ignored outside round 2");
            return;
        }
        let participant_id = share.participant_id;
        if !self.current_attempt(attempt_id) || !self.bound_sender(&sender, participant_id) {
            warn!(participant_id, "Share with foreign attempt or sender ignored");
            return;
        }
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if !attempt.record_share(share) {
            warn!(participant_id, "Share without a recorded commitment ignored");
            return;
        }
        debug!(
            participant_id,
            received = attempt.share_count(),
            expected = attempt.commitment_count(),
            "Share recorded"
        );
        if self.state == CoordinatorState::Round2Collect && attempt.has_all_shares() {
            self.begin_aggregation(fx);
        }
    }

    fn begin_aggregation(&mut self, fx: &mut Effects) {
        let Some(attempt) = &self.attempt else {
            return;
        };
        let Some(context) = attempt.signing_context() else {
            self.fail(
                CeremonyErrorCode::AggregationFailed,
                "no signing package for aggregation",
                Some(AbortReason::AggregationFailed),
                fx,
            );
            return;
        };
        let effect = CoordinatorEffect::Aggregate {
            backend_id: attempt.backend_id.clone(),
            context,
            shares: attempt.shares(),
            public_key_package: attempt.public_key_package.clone(),
        };
        self.enter(CoordinatorState::Aggregating, fx);
        fx.push(effect);
    }

    fn on_aggregated(&mut self, signature: Vec<u8>, verified: bool, fx: &mut Effects) {
        if self.state != CoordinatorState::Aggregating {
            return;
        }
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if !verified {
            warn!(attempt_id = %attempt.attempt_id, "Aggregated signature failed verification");
        }
        attempt.signature = Some(signature.clone());
        attempt.verified = verified;
        let payload = Payload::SignatureResult(SignatureResultPayload {
            attempt_id: attempt.attempt_id,
            signature,
            verified,
        });
        let recipients = self.signer_keys();

        self.enter(CoordinatorState::Broadcasting, fx);
        fx.push(CoordinatorEffect::Send {
            purpose: SendPurpose::SignatureResult,
            recipients,
            payload,
        });
    }

    fn on_send_finished(&mut self, purpose: SendPurpose, error: Option<String>, fx: &mut Effects) {
        if let Some(error) = &error {
            warn!(?purpose, %error, "Send failed");
        }
        match (purpose, self.state) {
            (SendPurpose::CommitmentsSet, CoordinatorState::Round2Send) => {
                self.enter(CoordinatorState::Round2Collect, fx);
                if self.attempt.as_ref().is_some_and(SigningAttempt::has_all_shares) {
                    self.begin_aggregation(fx);
                }
            }
            (SendPurpose::SignatureResult, CoordinatorState::Broadcasting) => {
                self.enter(CoordinatorState::Complete, fx);
                fx.push(CoordinatorEffect::StopPolling);
                info!("Signing ceremony complete");
            }
            (SendPurpose::Abort, CoordinatorState::Aborting) => self.begin_close(fx),
            _ => {}
        }
    }

    fn on_abort_received(
        &mut self,
        sender: PeerKey,
        reason: AbortReason,
        message: Option<String>,
        fx: &mut Effects,
    ) {
        if !self.state.is_active() {
            debug!(state = %self.state, %reason, "Abort ignored");
            return;
        }
        let Some(participant_id) = self
            .session
            .as_ref()
            .and_then(|s| s.participant_id_of(&sender))
        else {
            warn!(%reason, "Abort from unknown sender ignored");
            return;
        };

        let detail = match &message {
            Some(text) => format!("participant {} aborted ({}): {}", participant_id, reason, text),
            None => format!("participant {} aborted ({})", participant_id, reason),
        };
        warn!(participant_id, %reason, "Ceremony aborted by participant");
        self.record_error(CeremonyError::new(CeremonyErrorCode::Aborted, detail));
        self.abort_reason = Some(reason);
        self.begin_abort(reason, message, Some(sender), fx);
    }

    fn on_cancel(&mut self, fx: &mut Effects) {
        match self.state {
            CoordinatorState::CreatingSession => self.reset_to_idle(fx),
            state if state.is_active() => {
                self.record_error(CeremonyError::new(
                    CeremonyErrorCode::Aborted,
                    "cancelled by operator",
                ));
                self.abort_reason = Some(AbortReason::UserCancelled);
                self.begin_abort(
                    AbortReason::UserCancelled,
                    Some("cancelled by coordinator".into()),
                    None,
                    fx,
                );
            }
            CoordinatorState::Failed | CoordinatorState::Complete => self.begin_close(fx),
            _ => {}
        }
    }

    fn on_timer(&mut self, timer: TimerId, fx: &mut Effects) {
        if self.session_timer == Some(timer) {
            self.session_timer = None;
            if self.state == CoordinatorState::Waiting {
                self.fail(
                    CeremonyErrorCode::SessionExpired,
                    "no signing attempt started before the session timeout",
                    Some(AbortReason::SessionExpired),
                    fx,
                );
            }
            return;
        }
        if self.round_timer != Some(timer) {
            debug!(?timer, "Stale timer ignored");
            return;
        }
        self.round_timer = None;

        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        let threshold = self.session.as_ref().map_or(0, |s| usize::from(s.threshold));
        match self.state {
            CoordinatorState::Round1Collect => {
                if attempt.commitment_count() >= threshold {
                    warn!(
                        dropped = ?attempt.missing_commitments(),
                        "Round 1 timed out, continuing with responders"
                    );
                    attempt.narrow_to_committed();
                    self.begin_signing_package(fx);
                } else {
                    let missing = attempt.missing_commitments();
                    self.fail(
                        CeremonyErrorCode::Round1Timeout,
                        format!("missing commitments from {:?}", missing),
                        Some(AbortReason::Timeout),
                        fx,
                    );
                }
            }
            CoordinatorState::Round2Send | CoordinatorState::Round2Collect => {
                let missing = attempt.missing_shares();
                let code = if attempt.share_count() == 0 {
                    CeremonyErrorCode::Round2Timeout
                } else {
                    CeremonyErrorCode::SignerDropped
                };
                self.fail(
                    code,
                    format!("missing signature shares from {:?}", missing),
                    Some(AbortReason::Timeout),
                    fx,
                );
            }
            _ => {}
        }
    }

    fn signer_keys(&self) -> Vec<PeerKey> {
        let (Some(session), Some(attempt)) = (&self.session, &self.attempt) else {
            return Vec::new();
        };
        attempt
            .signer_ids
            .iter()
            .filter_map(|id| session.participant_key(*id).copied())
            .filter(|key| *key != self.identity)
            .collect()
    }

    fn abort_payload(&self, reason: AbortReason, message: Option<String>) -> Payload {
        let mut payload = AbortPayload::new(reason, self.attempt.as_ref().map(|a| a.attempt_id));
        payload.message = message;
        Payload::Abort(payload)
    }

    fn begin_abort(
        &mut self,
        reason: AbortReason,
        message: Option<String>,
        exclude: Option<PeerKey>,
        fx: &mut Effects,
    ) {
        self.enter(CoordinatorState::Aborting, fx);
        self.cancel_session_timer(fx);
        let recipients: Vec<PeerKey> = self
            .session
            .iter()
            .flat_map(|s| s.participant_public_keys.iter().copied())
            .filter(|key| Some(*key) != exclude && *key != self.identity)
            .collect();
        if recipients.is_empty() {
            self.begin_close(fx);
            return;
        }
        let payload = self.abort_payload(reason, message);
        fx.push(CoordinatorEffect::Send {
            purpose: SendPurpose::Abort,
            recipients,
            payload,
        });
    }

    fn begin_close(&mut self, fx: &mut Effects) {
        self.enter(CoordinatorState::Closing, fx);
        fx.push(CoordinatorEffect::StopPolling);
        match self.session.as_ref().map(|s| s.session_id) {
            Some(session_id) if !session_id.is_nil() => {
                fx.push(CoordinatorEffect::CloseSession { session_id });
            }
            _ => self.reset_to_idle(fx),
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
        warn!(error = %error, state = %self.state, "Ceremony failed");
        self.record_error(error.clone());
        self.enter(CoordinatorState::Failed, fx);
        self.cancel_session_timer(fx);
        fx.push(CoordinatorEffect::StopPolling);

        let Some(reason) = abort else {
            return;
        };
        self.abort_reason = Some(reason);
        let recipients: Vec<PeerKey> = match &self.session {
            Some(session) if !session.session_id.is_nil() => session
                .participant_public_keys
                .iter()
                .copied()
                .filter(|key| *key != self.identity)
                .collect(),
            _ => Vec::new(),
        };
        if !recipients.is_empty() {
            let payload = self.abort_payload(reason, Some(error.message));
            fx.push(CoordinatorEffect::Send {
                purpose: SendPurpose::Abort,
                recipients,
                payload,
            });
        }
    }

    fn reset_to_idle(&mut self, fx: &mut Effects) {
        self.cancel_round_timer(fx);
        self.cancel_session_timer(fx);
        self.state = CoordinatorState::Idle;
        if let Some(session) = self.session.take() {
            self.dedup.clear_session(session.session_id);
        }
        self.attempt = None;
        self.error = None;
        self.abort_reason = None;
    }

    fn enter(&mut self, next: CoordinatorState, fx: &mut Effects) {
        let keeps_round_timer = matches!(
            (self.state, next),
            (CoordinatorState::Round2Send, CoordinatorState::Round2Collect)
        );
        if !keeps_round_timer {
            self.cancel_round_timer(fx);
        }
        if self.state == CoordinatorState::Waiting && next != CoordinatorState::Waiting {
            self.cancel_session_timer(fx);
        }
        self.state = next;

        match next {
            CoordinatorState::Waiting => {
                let timer = self.next_timer(TimerKind::Session);
                self.session_timer = Some(timer);
                fx.push(CoordinatorEffect::StartTimer {
                    timer,
                    duration: self.config.session_timeout,
                });
            }
            CoordinatorState::Round1Collect => {
                self.start_round_timer(self.config.round1_timeout, fx)
            }
            CoordinatorState::Round2Send => self.start_round_timer(self.config.round2_timeout, fx),
            _ => {}
        }
    }

    fn next_timer(&mut self, kind: TimerKind) -> TimerId {
        self.timer_epoch += 1;
        TimerId {
            kind,
            epoch: self.timer_epoch,
        }
    }

    fn start_round_timer(&mut self, duration: Duration, fx: &mut Effects) {
        let timer = self.next_timer(TimerKind::Round);
        self.round_timer = Some(timer);
        fx.push(CoordinatorEffect::StartTimer { timer, duration });
    }

    fn cancel_round_timer(&mut self, fx: &mut Effects) {
        if self.round_timer.take().is_some() {
            fx.push(CoordinatorEffect::CancelTimer(TimerKind::Round));
        }
    }

    fn cancel_session_timer(&mut self, fx: &mut Effects) {
        if self.session_timer.take().is_some() {
            fx.push(CoordinatorEffect::CancelTimer(TimerKind::Session));
        }
    }
}
