//! Transport seam between the orchestrator and the message relay
//!
//! The ceremony treats message bytes as opaque. Encryption, retries and the
//! network itself belong to the implementation behind [`Transport`].

use crate::types::{PeerKey, SessionId};
use crate::Result;

pub use ::async_trait::async_trait;

/// One message pulled from a session mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender: PeerKey,
    pub bytes: Vec<u8>,
}

/// Session-scoped message relay as seen by one identity
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity this endpoint sends as
    fn identity(&self) -> PeerKey;

    /// Open a session between the caller (as coordinator) and `participant_keys`
    async fn create_session(&self, participant_keys: &[PeerKey]) -> Result<SessionId>;

    /// Deliver `bytes` to each recipient's mailbox
    async fn send(&self, session_id: SessionId, recipients: &[PeerKey], bytes: Vec<u8>)
        -> Result<()>;

    /// Drain the caller's mailbox; coordinators read their own separate inbox
    async fn receive(&self, session_id: SessionId, as_coordinator: bool)
        -> Result<Vec<InboundMessage>>;

    async fn close_session(&self, session_id: SessionId) -> Result<()>;
}

/// In-memory transport for tests and local ceremonies
pub mod memory;

pub use memory::{MemoryEndpoint, MemoryTransport};
