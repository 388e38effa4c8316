//! Coordinator driver

use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::{log_rejection, TaskScope, Wakeup};
use crate::backend::{aggregate_and_verify, backend_for, build_signing_package, SigningBackend};
use crate::config::CeremonyConfig;
use crate::coordinator::{
    CoordinatorEffect, CoordinatorEvent, CoordinatorMachine, CoordinatorState, StartSigning,
};
use crate::message::Envelope;
use crate::transport::{InboundMessage, Transport};
use crate::types::{MessageId, ParticipantId, PeerKey, SessionId};
use crate::validation::Freshness;
use crate::{Error, Result};

/// Successful signing attempt as seen by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningOutcome {
    pub session_id: SessionId,
    pub attempt_id: MessageId,
    pub signer_ids: Vec<ParticipantId>,
    pub signature: Vec<u8>,
    pub verified: bool,
}

/// Runs a [`CoordinatorMachine`] over a transport
pub struct CoordinatorDriver {
    machine: CoordinatorMachine,
    transport: Arc<dyn Transport>,
    config: CeremonyConfig,
    backend: Option<Arc<dyn SigningBackend>>,
    scope: TaskScope<CoordinatorEvent>,
}

impl CoordinatorDriver {
    pub fn new(transport: Arc<dyn Transport>, config: CeremonyConfig) -> Self {
        let machine = CoordinatorMachine::new(transport.identity(), config.clone());
        Self {
            machine,
            transport,
            config,
            backend: None,
            scope: TaskScope::new(),
        }
    }

    pub fn machine(&self) -> &CoordinatorMachine {
        &self.machine
    }

    pub fn state(&self) -> CoordinatorState {
        self.machine.state()
    }

    /// Open a session and wait until it is ready for signing
    #[instrument(skip_all, fields(participants = participant_keys.len(), threshold = threshold))]
    pub async fn create_session(
        &mut self,
        participant_keys: Vec<PeerKey>,
        threshold: u16,
    ) -> Result<SessionId> {
        self.pump();
        if self.machine.state() != CoordinatorState::Idle {
            return Err(Error::InvalidConfig(format!(
                "Coordinator is busy ({})",
                self.machine.state()
            )));
        }

        self.dispatch(CoordinatorEvent::CreateSession {
            participant_keys,
            threshold,
        });
        self.run_until(|state| state != CoordinatorState::CreatingSession)
            .await?;

        match (self.machine.state(), self.machine.session()) {
            (CoordinatorState::Waiting, Some(session)) => Ok(session.session_id),
            _ => Err(self.failure()),
        }
    }

    /// Run one signing attempt to completion
    #[instrument(skip_all, fields(signers = ?request.signer_ids, backend = %request.backend_id))]
    pub async fn sign(&mut self, request: StartSigning) -> Result<SigningOutcome> {
        self.pump();
        if self.machine.state() != CoordinatorState::Waiting {
            return Err(Error::InvalidConfig(format!(
                "Cannot start signing while {}",
                self.machine.state()
            )));
        }

        self.dispatch(CoordinatorEvent::StartSigning(request));
        if self.machine.state() == CoordinatorState::Waiting {
            // request refused; machine stays usable
            return Err(self.failure());
        }
        self.run_until(|state| {
            matches!(
                state,
                CoordinatorState::Complete | CoordinatorState::Failed | CoordinatorState::Idle
            )
        })
        .await?;

        let (Some(session), Some(attempt), Some((signature, verified))) = (
            self.machine.session(),
            self.machine.attempt(),
            self.machine.signature(),
        ) else {
            return Err(self.failure());
        };
        if self.machine.state() != CoordinatorState::Complete {
            return Err(self.failure());
        }
        Ok(SigningOutcome {
            session_id: session.session_id,
            attempt_id: attempt.attempt_id,
            signer_ids: attempt.signer_ids.clone(),
            signature: signature.to_vec(),
            verified,
        })
    }

    /// Abort the running ceremony and close its session
    #[instrument(skip_all)]
    pub async fn cancel(&mut self) -> Result<()> {
        self.pump();
        self.dispatch(CoordinatorEvent::Cancel);
        self.settle().await
    }

    /// Return to idle from any state, closing an open session
    #[instrument(skip_all)]
    pub async fn reset(&mut self) -> Result<()> {
        self.pump();
        self.dispatch(CoordinatorEvent::Reset);
        self.settle().await
    }

    async fn settle(&mut self) -> Result<()> {
        self.run_until(|state| {
            !matches!(
                state,
                CoordinatorState::Aborting | CoordinatorState::Closing
            )
        })
        .await?;
        if self.machine.state() == CoordinatorState::Idle {
            self.scope.invalidate();
            self.backend = None;
        }
        Ok(())
    }

    fn failure(&self) -> Error {
        match self.machine.error().or(self.machine.last_error()) {
            Some(error) => Error::Ceremony(error.clone()),
            None => Error::Internal(format!(
                "Coordinator stopped in state {}",
                self.machine.state()
            )),
        }
    }

    /// Deliver wakeups that are already queued
    fn pump(&mut self) {
        while let Some(wakeup) = self.scope.try_next() {
            self.wake(wakeup);
        }
    }

    async fn run_until(&mut self, done: impl Fn(CoordinatorState) -> bool) -> Result<()> {
        while !done(self.machine.state()) {
            let wakeup = self
                .scope
                .next()
                .await
                .ok_or_else(|| Error::Internal("Driver event channel closed".into()))?;
            self.wake(wakeup);
        }
        Ok(())
    }

    fn wake(&mut self, wakeup: Wakeup<CoordinatorEvent>) {
        let event = match wakeup {
            Wakeup::Event(event) => Some(event),
            Wakeup::Inbound(message) => self.inbound(message),
        };
        if let Some(event) = event {
            self.dispatch(event);
        }
    }

    fn inbound(&mut self, message: InboundMessage) -> Option<CoordinatorEvent> {
        let freshness = Freshness::from_config(&self.config);
        match self.machine.validate_inbound(&message.bytes, freshness) {
            Ok(envelope) if envelope.sender_public_key != message.sender => {
                warn!(
                    message_type = %envelope.message_type(),
                    "Envelope sender differs from transport sender"
                );
                None
            }
            Ok(envelope) => CoordinatorMachine::inbound_event(envelope),
            Err(error) => {
                log_rejection(&error);
                None
            }
        }
    }

    fn dispatch(&mut self, event: CoordinatorEvent) {
        for effect in self.machine.step(event) {
            self.execute(effect);
        }
    }

    fn backend(&mut self, backend_id: &str) -> Result<Arc<dyn SigningBackend>> {
        match &self.backend {
            Some(backend) if backend.id() == backend_id => Ok(backend.clone()),
            _ => {
                let backend = backend_for(backend_id)?;
                self.backend = Some(backend.clone());
                Ok(backend)
            }
        }
    }

    fn execute(&mut self, effect: CoordinatorEffect) {
        match effect {
            CoordinatorEffect::CreateSession { participant_keys } => {
                let transport = self.transport.clone();
                self.scope.spawn(async move {
                    match transport.create_session(&participant_keys).await {
                        Ok(session_id) => {
                            info!(%session_id, "Session created");
                            CoordinatorEvent::SessionCreated { session_id }
                        }
                        Err(e) => CoordinatorEvent::SessionCreationFailed {
                            reason: e.to_string(),
                        },
                    }
                });
            }
            CoordinatorEffect::StartPolling { session_id } => self.scope.start_polling(
                self.transport.clone(),
                session_id,
                true,
                self.config.poll_interval,
            ),
            CoordinatorEffect::StopPolling => self.scope.stop_polling(),
            CoordinatorEffect::Send {
                purpose,
                recipients,
                payload,
            } => {
                let transport = self.transport.clone();
                let session_id = self.machine.session().map(|s| s.session_id);
                let identity = self.machine.identity();
                self.scope.spawn(async move {
                    let Some(session_id) = session_id else {
                        return CoordinatorEvent::SendFinished {
                            purpose,
                            error: Some("no open session".into()),
                        };
                    };
                    let envelope = Envelope::new(session_id, identity, payload);
                    let error = match envelope.to_bytes() {
                        Ok(bytes) => transport
                            .send(session_id, &recipients, bytes)
                            .await
                            .err()
                            .map(|e| e.to_string()),
                        Err(e) => Some(e.to_string()),
                    };
                    CoordinatorEvent::SendFinished { purpose, error }
                });
            }
            CoordinatorEffect::BuildSigningPackage {
                backend_id,
                message,
                commitments,
                group_public_key,
            } => {
                let backend = self.backend(&backend_id);
                self.scope.spawn(async move {
                    let result = tokio::task::spawn_blocking(move || {
                        build_signing_package(
                            backend?.as_ref(),
                            &message,
                            &commitments,
                            &group_public_key,
                        )
                    })
                    .await;
                    match result {
                        Ok(Ok(output)) => CoordinatorEvent::SigningPackageBuilt {
                            signing_package: output.signing_package,
                            randomizer: output.randomizer,
                        },
                        Ok(Err(e)) => CoordinatorEvent::SigningPackageFailed {
                            reason: e.to_string(),
                        },
                        Err(e) => CoordinatorEvent::SigningPackageFailed {
                            reason: e.to_string(),
                        },
                    }
                });
            }
            CoordinatorEffect::Aggregate {
                backend_id,
                context,
                shares,
                public_key_package,
            } => {
                let backend = self.backend(&backend_id);
                self.scope.spawn(async move {
                    let result = tokio::task::spawn_blocking(move || {
                        aggregate_and_verify(backend?.as_ref(), &context, &shares, &public_key_package)
                    })
                    .await;
                    match result {
                        Ok(Ok(output)) => CoordinatorEvent::Aggregated {
                            signature: output.signature,
                            verified: output.verified,
                        },
                        Ok(Err(e)) => CoordinatorEvent::AggregationFailed {
                            reason: e.to_string(),
                        },
                        Err(e) => CoordinatorEvent::AggregationFailed {
                            reason: e.to_string(),
                        },
                    }
                });
            }
            CoordinatorEffect::CloseSession { session_id } => {
                let transport = self.transport.clone();
                self.scope.spawn(async move {
                    let error = transport
                        .close_session(session_id)
                        .await
                        .err()
                        .map(|e| e.to_string());
                    CoordinatorEvent::SessionClosed { error }
                });
            }
            CoordinatorEffect::StartTimer { timer, duration } => {
                self.scope
                    .start_timer(timer, duration, CoordinatorEvent::TimerFired(timer))
            }
            CoordinatorEffect::CancelTimer(kind) => self.scope.cancel_timer(kind),
        }
    }
}
