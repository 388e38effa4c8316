//! Signing backend abstraction
//!
//! A backend owns the curve arithmetic of one FROST ciphersuite. The
//! ceremony machines only see opaque bytes; they pick a backend once per
//! ceremony through [`backend_for`] and never switch mid-attempt.
//!
//! Rerandomizing backends expose a [`Rerandomize`] capability. Its
//! absence is how a backend says no randomizer is needed.

mod secp256k1;

pub use secp256k1::Secp256k1Backend;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::{hex_opt_vec, hex_vec, Commitment, ParticipantId, SignatureShare};
use crate::{Error, Result};

/// Identifiers of every backend this crate ships
pub const SUPPORTED_BACKENDS: [&str; 2] = [
    Secp256k1Backend::PLAIN_ID,
    Secp256k1Backend::RERANDOMIZED_ID,
];

/// Look up a backend by its wire identifier
pub fn backend_for(id: &str) -> Result<Arc<dyn SigningBackend>> {
    match id {
        Secp256k1Backend::PLAIN_ID => Ok(Arc::new(Secp256k1Backend::new())),
        Secp256k1Backend::RERANDOMIZED_ID => Ok(Arc::new(Secp256k1Backend::rerandomized())),
        other => Err(Error::InvalidConfig(format!(
            "Unknown backend `{}`, expected one of {:?}",
            other, SUPPORTED_BACKENDS
        ))),
    }
}

/// Curve-specific FROST operations
pub trait SigningBackend: Send + Sync {
    /// Stable identifier negotiated between coordinator and participants
    fn id(&self) -> &'static str;

    /// Signing-package construction for rerandomizing ciphersuites
    fn rerandomizer(&self) -> Option<&dyn Rerandomize> {
        None
    }

    fn requires_randomizer(&self) -> bool {
        self.rerandomizer().is_some()
    }

    /// Trusted-dealer key generation
    fn generate_key_shares(&self, threshold: u16, total: u16) -> Result<DealerOutput>;

    /// Fresh nonce pair and the matching public commitment
    fn generate_round1(&self, key_share: &KeyShare) -> Result<Round1Output>;

    /// Partial signature over the signing package in `context`
    fn generate_round2(
        &self,
        key_share: &KeyShare,
        nonces: &SigningNonces,
        context: &SigningContext,
    ) -> Result<SignatureShare>;

    /// Combine partial signatures into the final signature
    fn aggregate(
        &self,
        context: &SigningContext,
        shares: &[SignatureShare],
        public_key_package: &PublicKeyPackage,
    ) -> Result<Vec<u8>>;

    fn verify(
        &self,
        group_public_key: &[u8],
        message: &[u8],
        signature: &[u8],
        randomizer: Option<&[u8]>,
    ) -> Result<bool>;
}

/// Optional capability of rerandomizing backends
pub trait Rerandomize: Send + Sync {
    /// Build the signing package together with a fresh randomizer
    fn create_signing_package(
        &self,
        message: &[u8],
        commitments: &[Commitment],
        group_public_key: &[u8],
    ) -> Result<SigningPackageOutput>;
}

/// Signing package plus the randomizer it was built with, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningPackageOutput {
    pub signing_package: Vec<u8>,
    pub randomizer: Option<Vec<u8>>,
}

/// Everything needed to produce or combine round-2 shares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningContext {
    pub message: Vec<u8>,
    pub commitments: Vec<Commitment>,
    pub signing_package: Vec<u8>,
    pub randomizer: Option<Vec<u8>>,
    pub group_public_key: Vec<u8>,
}

/// Result of [`aggregate_and_verify`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateOutput {
    pub signature: Vec<u8>,
    pub verified: bool,
}

/// Secret key share of one participant
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct KeyShare {
    pub backend_id: String,
    pub participant_id: ParticipantId,
    pub threshold: u16,
    pub total_participants: u16,
    #[serde(with = "hex_vec")]
    pub secret_share: Vec<u8>,
    #[serde(with = "hex_vec")]
    pub group_public_key: Vec<u8>,
}

impl fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyShare")
            .field("backend_id", &self.backend_id)
            .field("participant_id", &self.participant_id)
            .field("threshold", &self.threshold)
            .field("total_participants", &self.total_participants)
            .field("secret_share", &"<redacted>")
            .field("group_public_key", &hex::encode(&self.group_public_key))
            .finish()
    }
}

/// Public verification material for a key group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyPackage {
    pub backend_id: String,
    #[serde(with = "hex_vec")]
    pub group_public_key: Vec<u8>,
    pub verifying_shares: Vec<VerifyingShare>,
}

impl PublicKeyPackage {
    pub fn verifying_share(&self, id: ParticipantId) -> Option<&[u8]> {
        self.verifying_shares
            .iter()
            .find(|share| share.participant_id == id)
            .map(|share| share.key.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyingShare {
    pub participant_id: ParticipantId,
    #[serde(with = "hex_vec")]
    pub key: Vec<u8>,
}

/// Output of trusted-dealer key generation
#[derive(Debug, Clone)]
pub struct DealerOutput {
    pub key_shares: Vec<KeyShare>,
    pub public_key_package: PublicKeyPackage,
}

/// Round-1 secret nonces; single use, never cloned
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SigningNonces {
    participant_id: ParticipantId,
    hiding: Vec<u8>,
    binding: Vec<u8>,
}

impl SigningNonces {
    pub fn new(participant_id: ParticipantId, hiding: Vec<u8>, binding: Vec<u8>) -> Self {
        Self {
            participant_id,
            hiding,
            binding,
        }
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    pub(crate) fn hiding(&self) -> &[u8] {
        &self.hiding
    }

    pub(crate) fn binding(&self) -> &[u8] {
        &self.binding
    }
}

impl fmt::Debug for SigningNonces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningNonces")
            .field("participant_id", &self.participant_id)
            .finish_non_exhaustive()
    }
}

/// Round-1 output of one participant
#[derive(Debug)]
pub struct Round1Output {
    pub nonces: SigningNonces,
    pub commitment: Commitment,
}

/// Wire shape of the signing package shipped inside `COMMITMENTS_SET`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningPackageBundle {
    #[serde(with = "hex_vec")]
    pub message: Vec<u8>,
    pub commitments: Vec<Commitment>,
    #[serde(default, with = "hex_opt_vec", skip_serializing_if = "Option::is_none")]
    pub randomizer: Option<Vec<u8>>,
}

/// Encode a signing package; commitments are sorted by participant id
pub fn encode_signing_package(
    message: &[u8],
    commitments: &[Commitment],
    randomizer: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let mut commitments = commitments.to_vec();
    commitments.sort_by_key(|c| c.participant_id);
    let bundle = SigningPackageBundle {
        message: message.to_vec(),
        commitments,
        randomizer: randomizer.map(<[u8]>::to_vec),
    };
    Ok(serde_json::to_vec(&bundle)?)
}

pub fn decode_signing_package(bytes: &[u8]) -> Result<SigningPackageBundle> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Deserialization(format!("Invalid signing package: {}", e)))
}

/// Build the signing package the way `backend` requires
pub fn build_signing_package(
    backend: &dyn SigningBackend,
    message: &[u8],
    commitments: &[Commitment],
    group_public_key: &[u8],
) -> Result<SigningPackageOutput> {
    if commitments.is_empty() {
        return Err(Error::Crypto("No commitments to build a signing package from".into()));
    }
    match backend.rerandomizer() {
        Some(rerandomizer) => {
            rerandomizer.create_signing_package(message, commitments, group_public_key)
        }
        None => Ok(SigningPackageOutput {
            signing_package: encode_signing_package(message, commitments, None)?,
            randomizer: None,
        }),
    }
}

/// Aggregate shares, then independently verify the result
pub fn aggregate_and_verify(
    backend: &dyn SigningBackend,
    context: &SigningContext,
    shares: &[SignatureShare],
    public_key_package: &PublicKeyPackage,
) -> Result<AggregateOutput> {
    let signature = backend.aggregate(context, shares, public_key_package)?;
    let verified = backend.verify(
        &context.group_public_key,
        &context.message,
        &signature,
        context.randomizer.as_deref(),
    )?;
    debug!(
        backend = backend.id(),
        shares = shares.len(),
        verified,
        "Aggregated signature"
    );
    Ok(AggregateOutput {
        signature,
        verified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_lookup() {
        for id in SUPPORTED_BACKENDS {
            assert_eq!(backend_for(id).unwrap().id(), id);
        }
        assert!(!backend_for(Secp256k1Backend::PLAIN_ID).unwrap().requires_randomizer());
        assert!(backend_for(Secp256k1Backend::RERANDOMIZED_ID)
            .unwrap()
            .requires_randomizer());
        assert!(matches!(backend_for("frost-ed25519"), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_signing_package_sorts_commitments() {
        let commitments = vec![
            Commitment {
                participant_id: 3,
                hiding: vec![3],
                binding: vec![3],
            },
            Commitment {
                participant_id: 1,
                hiding: vec![1],
                binding: vec![1],
            },
        ];
        let bytes = encode_signing_package(b"msg", &commitments, None).unwrap();
        let bundle = decode_signing_package(&bytes).unwrap();

        assert_eq!(bundle.message, b"msg");
        assert_eq!(bundle.commitments[0].participant_id, 1);
        assert_eq!(bundle.commitments[1].participant_id, 3);
        assert_eq!(bundle.randomizer, None);
    }

    #[test]
    fn test_key_share_debug_redacts_secret() {
        let share = KeyShare {
            backend_id: Secp256k1Backend::PLAIN_ID.into(),
            participant_id: 1,
            threshold: 2,
            total_participants: 3,
            secret_share: vec![0x42; 32],
            group_public_key: vec![2; 33],
        };
        let debug = format!("{:?}", share);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(&hex::encode([0x42u8; 32])));
    }

    #[test]
    fn test_plain_backend_builds_package_without_randomizer() {
        let backend = Secp256k1Backend::new();
        let commitment = Commitment {
            participant_id: 1,
            hiding: vec![1],
            binding: vec![2],
        };
        let output = build_signing_package(&backend, b"m", &[commitment], &[2; 33]).unwrap();
        assert_eq!(output.randomizer, None);
        assert!(build_signing_package(&backend, b"m", &[], &[2; 33]).is_err());
    }
}
