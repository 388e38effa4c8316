//! Error types for ceremony operations

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::validation::ValidationError;

/// Result type alias for ceremony operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a ceremony
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid session or ceremony configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Network/transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Inbound message rejected by the validator
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Ceremony ended in a failed or aborted state
    #[error(transparent)]
    Ceremony(#[from] CeremonyError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Failure codes surfaced by the coordinator and participant machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CeremonyErrorCode {
    SessionCreationFailed,
    Round1Timeout,
    Round2Timeout,
    ThresholdNotMet,
    InvalidMessage,
    AggregationFailed,
    SignerDropped,
    SessionExpired,
    Aborted,
    NonceReuseDetected,
    SigningFailed,
    InvalidCommitment,
    ResultTimeout,
}

impl CeremonyErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CeremonyErrorCode::SessionCreationFailed => "SessionCreationFailed",
            CeremonyErrorCode::Round1Timeout => "Round1Timeout",
            CeremonyErrorCode::Round2Timeout => "Round2Timeout",
            CeremonyErrorCode::ThresholdNotMet => "ThresholdNotMet",
            CeremonyErrorCode::InvalidMessage => "InvalidMessage",
            CeremonyErrorCode::AggregationFailed => "AggregationFailed",
            CeremonyErrorCode::SignerDropped => "SignerDropped",
            CeremonyErrorCode::SessionExpired => "SessionExpired",
            CeremonyErrorCode::Aborted => "Aborted",
            CeremonyErrorCode::NonceReuseDetected => "NonceReuseDetected",
            CeremonyErrorCode::SigningFailed => "SigningFailed",
            CeremonyErrorCode::InvalidCommitment => "InvalidCommitment",
            CeremonyErrorCode::ResultTimeout => "ResultTimeout",
        }
    }
}

impl fmt::Display for CeremonyErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure recorded by a state machine
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct CeremonyError {
    pub code: CeremonyErrorCode,
    pub message: String,
}

impl CeremonyError {
    pub fn new(code: CeremonyErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceremony_error_display() {
        let err = CeremonyError::new(CeremonyErrorCode::Round1Timeout, "missing commitments from [1]");
        assert_eq!(err.to_string(), "Round1Timeout: missing commitments from [1]");
    }

    #[test]
    fn test_json_error_maps_to_serialization() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        assert!(matches!(Error::from(json_err), Error::Serialization(_)));
    }
}
