//! In-memory mailbox transport

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{async_trait, InboundMessage, Transport};
use crate::types::{PeerKey, SessionId};
use crate::{Error, Result};

/// Default session lifetime on the hub
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

/// Mailboxes of one session
#[derive(Debug)]
struct SessionMailbox {
    coordinator: PeerKey,
    participants: Vec<PeerKey>,
    expires_at: DateTime<Utc>,
    /// Closed sessions accept no sends but let members drain what is queued
    closed: bool,
    /// Messages addressed to the coordinator
    coordinator_inbox: Vec<InboundMessage>,
    /// Messages addressed to each participant
    inboxes: HashMap<PeerKey, Vec<InboundMessage>>,
}

impl SessionMailbox {
    fn is_member(&self, key: &PeerKey) -> bool {
        *key == self.coordinator || self.participants.contains(key)
    }
}

/// Shared hub holding every session; hand out endpoints with [`connect`](Self::connect)
#[derive(Clone)]
pub struct MemoryTransport {
    sessions: Arc<DashMap<SessionId, SessionMailbox>>,
    ttl: Duration,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_SESSION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Endpoint that sends and receives as `identity`
    pub fn connect(&self, identity: PeerKey) -> MemoryEndpoint {
        MemoryEndpoint {
            hub: self.clone(),
            identity,
        }
    }

    /// Number of open sessions
    pub fn session_count(&self) -> usize {
        self.sessions.iter().filter(|entry| !entry.closed).count()
    }

    /// Remove expired sessions, returning how many were dropped
    pub fn cleanup(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, mailbox| mailbox.expires_at > now);
        before - self.sessions.len()
    }

    fn expiry(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn with_session<T>(
        &self,
        session_id: SessionId,
        f: impl FnOnce(&mut SessionMailbox) -> Result<T>,
    ) -> Result<T> {
        let mut entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if entry.expires_at <= Utc::now() {
            drop(entry);
            self.sessions.remove(&session_id);
            return Err(Error::SessionNotFound(format!("{} (expired)", session_id)));
        }
        f(entry.value_mut())
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// One identity's view of a [`MemoryTransport`]
#[derive(Clone)]
pub struct MemoryEndpoint {
    hub: MemoryTransport,
    identity: PeerKey,
}

impl MemoryEndpoint {
    pub fn hub(&self) -> &MemoryTransport {
        &self.hub
    }
}

#[async_trait]
impl Transport for MemoryEndpoint {
    fn identity(&self) -> PeerKey {
        self.identity
    }

    async fn create_session(&self, participant_keys: &[PeerKey]) -> Result<SessionId> {
        if participant_keys.is_empty() {
            return Err(Error::InvalidConfig("Session needs participants".into()));
        }
        let session_id = Uuid::new_v4();
        let mailbox = SessionMailbox {
            coordinator: self.identity,
            participants: participant_keys.to_vec(),
            expires_at: self.hub.expiry(),
            closed: false,
            coordinator_inbox: Vec::new(),
            inboxes: HashMap::new(),
        };
        self.hub.sessions.insert(session_id, mailbox);
        debug!(%session_id, participants = participant_keys.len(), "Mailbox session created");
        Ok(session_id)
    }

    async fn send(
        &self,
        session_id: SessionId,
        recipients: &[PeerKey],
        bytes: Vec<u8>,
    ) -> Result<()> {
        let sender = self.identity;
        self.hub.with_session(session_id, |mailbox| {
            if mailbox.closed {
                return Err(Error::SessionNotFound(format!("{} (closed)", session_id)));
            }
            if !mailbox.is_member(&sender) {
                return Err(Error::Transport(format!(
                    "{} is not a member of session {}",
                    sender, session_id
                )));
            }
            if let Some(stranger) = recipients.iter().find(|r| !mailbox.is_member(r)) {
                return Err(Error::Transport(format!(
                    "Recipient {} is not a member of session {}",
                    stranger, session_id
                )));
            }

            for recipient in recipients {
                let message = InboundMessage {
                    sender,
                    bytes: bytes.clone(),
                };
                if *recipient == mailbox.coordinator {
                    mailbox.coordinator_inbox.push(message);
                } else {
                    mailbox.inboxes.entry(*recipient).or_default().push(message);
                }
            }
            Ok(())
        })
    }

    async fn receive(
        &self,
        session_id: SessionId,
        as_coordinator: bool,
    ) -> Result<Vec<InboundMessage>> {
        let identity = self.identity;
        self.hub.with_session(session_id, |mailbox| {
            let queued = if as_coordinator {
                if identity != mailbox.coordinator {
                    return Err(Error::Transport(format!(
                        "{} is not the coordinator of session {}",
                        identity, session_id
                    )));
                }
                std::mem::take(&mut mailbox.coordinator_inbox)
            } else {
                if !mailbox.participants.contains(&identity) {
                    return Err(Error::Transport(format!(
                        "{} is not a participant of session {}",
                        identity, session_id
                    )));
                }
                mailbox.inboxes.remove(&identity).unwrap_or_default()
            };
            if mailbox.closed && queued.is_empty() {
                return Err(Error::SessionNotFound(format!("{} (closed)", session_id)));
            }
            Ok(queued)
        })
    }

    async fn close_session(&self, session_id: SessionId) -> Result<()> {
        let identity = self.identity;
        self.hub.with_session(session_id, |mailbox| {
            if mailbox.closed {
                return Err(Error::SessionNotFound(format!("{} (closed)", session_id)));
            }
            if identity != mailbox.coordinator {
                return Err(Error::Transport(format!(
                    "Only the coordinator may close session {}",
                    session_id
                )));
            }
            mailbox.closed = true;
            debug!(%session_id, "Mailbox session closed");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: u8) -> Vec<PeerKey> {
        (1..=n).map(|i| PeerKey::new([i; 32])).collect()
    }

    #[tokio::test]
    async fn test_coordinator_and_participant_inboxes() {
        let hub = MemoryTransport::new();
        let participants = keys(2);
        let coordinator = hub.connect(PeerKey::new([0xc0; 32]));
        let alice = hub.connect(participants[0]);
        let bob = hub.connect(participants[1]);

        let session_id = coordinator.create_session(&participants).await.unwrap();
        coordinator
            .send(session_id, &participants, b"package".to_vec())
            .await
            .unwrap();
        alice
            .send(session_id, &[coordinator.identity()], b"commitment".to_vec())
            .await
            .unwrap();

        let inbound = alice.receive(session_id, false).await.unwrap();
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].sender, coordinator.identity());
        assert_eq!(inbound[0].bytes, b"package");

        let inbound = coordinator.receive(session_id, true).await.unwrap();
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].sender, participants[0]);

        // receiving drains the mailbox
        assert!(alice.receive(session_id, false).await.unwrap().is_empty());
        assert_eq!(bob.receive(session_id, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_membership_enforced() {
        let hub = MemoryTransport::new();
        let participants = keys(2);
        let coordinator = hub.connect(PeerKey::new([0xc0; 32]));
        let stranger = hub.connect(PeerKey::new([0xee; 32]));
        let session_id = coordinator.create_session(&participants).await.unwrap();

        assert!(matches!(
            stranger.send(session_id, &participants, vec![1]).await,
            Err(Error::Transport(_))
        ));
        assert!(matches!(
            coordinator
                .send(session_id, &[stranger.identity()], vec![1])
                .await,
            Err(Error::Transport(_))
        ));
        assert!(hub
            .connect(participants[0])
            .receive(session_id, true)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_close_and_unknown_session() {
        let hub = MemoryTransport::new();
        let coordinator = hub.connect(PeerKey::new([0xc0; 32]));
        let session_id = coordinator.create_session(&keys(1)).await.unwrap();

        coordinator.close_session(session_id).await.unwrap();
        assert_eq!(hub.session_count(), 0);
        assert!(matches!(
            coordinator.receive(session_id, true).await,
            Err(Error::SessionNotFound(_))
        ));
        assert!(coordinator.close_session(session_id).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_session_drains_queued_messages() {
        let hub = MemoryTransport::new();
        let participants = keys(1);
        let coordinator = hub.connect(PeerKey::new([0xc0; 32]));
        let alice = hub.connect(participants[0]);
        let session_id = coordinator.create_session(&participants).await.unwrap();

        coordinator
            .send(session_id, &participants, b"abort".to_vec())
            .await
            .unwrap();
        coordinator.close_session(session_id).await.unwrap();

        assert!(alice.send(session_id, &[coordinator.identity()], vec![1]).await.is_err());
        assert_eq!(alice.receive(session_id, false).await.unwrap().len(), 1);
        assert!(matches!(
            alice.receive(session_id, false).await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_sessions() {
        let hub = MemoryTransport::with_ttl(Duration::ZERO);
        let coordinator = hub.connect(PeerKey::new([0xc0; 32]));
        let first = coordinator.create_session(&keys(1)).await.unwrap();
        coordinator.create_session(&keys(1)).await.unwrap();

        assert!(matches!(
            coordinator.receive(first, true).await,
            Err(Error::SessionNotFound(_))
        ));
        assert_eq!(hub.cleanup(), 1);
        assert_eq!(hub.session_count(), 0);
    }
}
