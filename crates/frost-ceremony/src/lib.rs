//! # FROST Ceremony
//!
//! Protocol core for coordinating a threshold-signature (FROST) ceremony
//! between one coordinator and a set of participants.
//!
//! This crate provides:
//! - The message envelope and the validator guarding every inbound message
//! - Deduplication and nonce-reuse tracking
//! - A pluggable [`SigningBackend`](backend::SigningBackend) abstraction with
//!   plain and rerandomizing secp256k1 reference backends
//! - Coordinator and participant state machines written as pure reducers
//! - Drivers that run the machines over a [`Transport`](transport::Transport)
//!
//! ## Protocol Overview
//!
//! 1. The coordinator creates a session and broadcasts a `SIGNING_PACKAGE`
//! 2. Selected signers answer with a `ROUND1_COMMITMENT`
//! 3. The coordinator broadcasts the `COMMITMENTS_SET`
//! 4. Each signer approves the message and returns a `ROUND2_SIGNATURE_SHARE`
//! 5. The coordinator aggregates and broadcasts the `SIGNATURE_RESULT`
//!
//! ## Example
//!
//! ```rust,ignore
//! use frost_ceremony::coordinator::StartSigning;
//! use frost_ceremony::orchestrator::CoordinatorDriver;
//! use frost_ceremony::CeremonyConfig;
//!
//! let mut coordinator = CoordinatorDriver::new(transport, CeremonyConfig::default());
//! let session_id = coordinator.create_session(participant_keys, 2).await?;
//! let request = StartSigning::new(message, vec![1, 2], public_key_package)?;
//! let outcome = coordinator.sign(request).await?;
//! ```

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod orchestrator;
pub mod participant;
pub mod transport;
pub mod types;
pub mod validation;

pub use config::CeremonyConfig;
pub use error::{CeremonyError, CeremonyErrorCode, Error, Result};
pub use message::{AbortReason, Envelope, MessageType, Payload, PROTOCOL_VERSION};
pub use types::{Commitment, MessageId, ParticipantId, PeerKey, Session, SessionId, SignatureShare};
pub use validation::{DedupSet, NonceTracker, ProtocolPhase, ValidationError, ValidationErrorCode};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
