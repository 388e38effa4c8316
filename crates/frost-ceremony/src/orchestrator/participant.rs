//! Participant driver

use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::{log_rejection, Approver, TaskScope, Wakeup};
use crate::backend::{backend_for, KeyShare, SigningBackend};
use crate::config::CeremonyConfig;
use crate::message::Envelope;
use crate::participant::{ParticipantEffect, ParticipantEvent, ParticipantMachine, ParticipantState};
use crate::transport::{InboundMessage, Transport};
use crate::types::{MessageId, ParticipantId, PeerKey, SessionId};
use crate::validation::Freshness;
use crate::{Error, Result};

/// Signature a participant saw the coordinator publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantOutcome {
    pub session_id: SessionId,
    pub attempt_id: MessageId,
    pub participant_id: ParticipantId,
    pub signature: Vec<u8>,
    pub verified: bool,
}

/// Runs a [`ParticipantMachine`] for one key share
pub struct ParticipantDriver {
    machine: ParticipantMachine,
    transport: Arc<dyn Transport>,
    backend: Arc<dyn SigningBackend>,
    key_share: Arc<KeyShare>,
    config: CeremonyConfig,
    approver: Option<Arc<dyn Approver>>,
    scope: TaskScope<ParticipantEvent>,
}

impl ParticipantDriver {
    /// Resolves the backend named by the key share
    pub fn new(
        transport: Arc<dyn Transport>,
        key_share: KeyShare,
        config: CeremonyConfig,
    ) -> Result<Self> {
        let backend = backend_for(&key_share.backend_id)?;
        let machine = ParticipantMachine::new(
            transport.identity(),
            key_share.participant_id,
            backend.id(),
            backend.requires_randomizer(),
            config.clone(),
        );
        Ok(Self {
            machine,
            transport,
            backend,
            key_share: Arc::new(key_share),
            config,
            approver: None,
            scope: TaskScope::new(),
        })
    }

    pub fn machine(&self) -> &ParticipantMachine {
        &self.machine
    }

    pub fn state(&self) -> ParticipantState {
        self.machine.state()
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.machine.participant_id()
    }

    /// Bind the driver to a session opened by `coordinator`
    pub fn join(&mut self, session_id: SessionId, coordinator: PeerKey) -> Result<()> {
        self.dispatch(ParticipantEvent::Join {
            session_id,
            coordinator,
        });
        if self.machine.state() != ParticipantState::Ready {
            return Err(Error::InvalidConfig(format!(
                "Cannot join while {}",
                self.machine.state()
            )));
        }
        Ok(())
    }

    /// Listen on the joined session until the ceremony completes or fails
    #[instrument(skip_all, fields(participant_id = self.machine.participant_id()))]
    pub async fn run(&mut self, approver: Arc<dyn Approver>) -> Result<ParticipantOutcome> {
        self.approver = Some(approver);
        self.pump();
        if self.machine.state() == ParticipantState::Ready {
            self.dispatch(ParticipantEvent::StartListening);
        }
        if !self.machine.state().is_active() {
            return Err(Error::InvalidConfig(format!(
                "Cannot run while {}",
                self.machine.state()
            )));
        }

        self.run_until(|state| state.is_terminal()).await?;

        let (Some(session_id), Some(attempt_id), Some((signature, verified))) = (
            self.machine.session_id(),
            self.machine.attempt_id(),
            self.machine.signature(),
        ) else {
            return Err(self.failure());
        };
        if self.machine.state() != ParticipantState::Complete {
            return Err(self.failure());
        }
        Ok(ParticipantOutcome {
            session_id,
            attempt_id,
            participant_id: self.machine.participant_id(),
            signature: signature.to_vec(),
            verified,
        })
    }

    /// Abort the ceremony, telling the coordinator
    #[instrument(skip_all, fields(participant_id = self.machine.participant_id()))]
    pub async fn cancel(&mut self) -> Result<()> {
        self.pump();
        self.dispatch(ParticipantEvent::Cancel);
        self.run_until(|state| state != ParticipantState::Aborting)
            .await
    }

    /// Drop the session and any outstanding work
    pub fn reset(&mut self) {
        self.dispatch(ParticipantEvent::Reset);
        if self.machine.state() == ParticipantState::Idle {
            self.scope.invalidate();
        }
    }

    fn failure(&self) -> Error {
        match self.machine.error().or(self.machine.last_error()) {
            Some(error) => Error::Ceremony(error.clone()),
            None => Error::Internal(format!(
                "Participant stopped in state {}",
                self.machine.state()
            )),
        }
    }

    fn pump(&mut self) {
        while let Some(wakeup) = self.scope.try_next() {
            self.wake(wakeup);
        }
    }

    async fn run_until(&mut self, done: impl Fn(ParticipantState) -> bool) -> Result<()> {
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

    fn wake(&mut self, wakeup: Wakeup<ParticipantEvent>) {
        let event = match wakeup {
            Wakeup::Event(event) => Some(event),
            Wakeup::Inbound(message) => self.inbound(message),
        };
        if let Some(event) = event {
            self.dispatch(event);
        }
    }

    fn inbound(&mut self, message: InboundMessage) -> Option<ParticipantEvent> {
        let freshness = Freshness::from_config(&self.config);
        match self.machine.validate_inbound(&message.bytes, freshness) {
            Ok(envelope) if envelope.sender_public_key != message.sender => {
                warn!(
                    message_type = %envelope.message_type(),
                    "Envelope sender differs from transport sender"
                );
                None
            }
            Ok(envelope) => ParticipantMachine::inbound_event(envelope),
            Err(error) => {
                log_rejection(&error);
                None
            }
        }
    }

    fn dispatch(&mut self, event: ParticipantEvent) {
        for effect in self.machine.step(event) {
            self.execute(effect);
        }
    }

    fn execute(&mut self, effect: ParticipantEffect) {
        match effect {
            ParticipantEffect::StartPolling { session_id } => self.scope.start_polling(
                self.transport.clone(),
                session_id,
                false,
                self.config.poll_interval,
            ),
            ParticipantEffect::StopPolling => self.scope.stop_polling(),
            ParticipantEffect::GenerateRound1 { attempt_id } => {
                let backend = self.backend.clone();
                let key_share = self.key_share.clone();
                self.scope.spawn(async move {
                    let result =
                        tokio::task::spawn_blocking(move || backend.generate_round1(&key_share))
                            .await;
                    match result {
                        Ok(Ok(output)) => ParticipantEvent::Round1Generated {
                            attempt_id,
                            nonces: output.nonces,
                            commitment: output.commitment,
                        },
                        Ok(Err(e)) => ParticipantEvent::Round1Failed {
                            attempt_id,
                            reason: e.to_string(),
                        },
                        Err(e) => ParticipantEvent::Round1Failed {
                            attempt_id,
                            reason: e.to_string(),
                        },
                    }
                });
            }
            ParticipantEffect::Send {
                purpose,
                recipient,
                payload,
            } => {
                let transport = self.transport.clone();
                let session_id = self.machine.session_id();
                let identity = self.machine.identity();
                self.scope.spawn(async move {
                    let Some(session_id) = session_id else {
                        return ParticipantEvent::SendFinished {
                            purpose,
                            error: Some("no joined session".into()),
                        };
                    };
                    let envelope = Envelope::new(session_id, identity, payload);
                    let error = match envelope.to_bytes() {
                        Ok(bytes) => transport
                            .send(session_id, &[recipient], bytes)
                            .await
                            .err()
                            .map(|e| e.to_string()),
                        Err(e) => Some(e.to_string()),
                    };
                    ParticipantEvent::SendFinished { purpose, error }
                });
            }
            ParticipantEffect::RequestApproval(request) => {
                let approver = self.approver.clone();
                self.scope.spawn(async move {
                    let approved = match approver {
                        Some(approver) => approver.approve(&request).await,
                        None => {
                            warn!("No approver attached, rejecting");
                            false
                        }
                    };
                    if approved {
                        ParticipantEvent::Approve
                    } else {
                        ParticipantEvent::Reject
                    }
                });
            }
            ParticipantEffect::GenerateShare {
                attempt_id,
                nonces,
                context,
            } => {
                let backend = self.backend.clone();
                let key_share = self.key_share.clone();
                self.scope.spawn(async move {
                    let result = tokio::task::spawn_blocking(move || {
                        backend.generate_round2(&key_share, &nonces, &context)
                    })
                    .await;
                    match result {
                        Ok(Ok(share)) => {
                            info!(%attempt_id, "Signature share generated");
                            ParticipantEvent::ShareGenerated { attempt_id, share }
                        }
                        Ok(Err(e)) => ParticipantEvent::ShareFailed {
                            attempt_id,
                            reason: e.to_string(),
                        },
                        Err(e) => ParticipantEvent::ShareFailed {
                            attempt_id,
                            reason: e.to_string(),
                        },
                    }
                });
            }
            ParticipantEffect::StartTimer { timer, duration } => {
                self.scope
                    .start_timer(timer, duration, ParticipantEvent::TimerFired(timer))
            }
            ParticipantEffect::CancelTimer(kind) => self.scope.cancel_timer(kind),
        }
    }
}
