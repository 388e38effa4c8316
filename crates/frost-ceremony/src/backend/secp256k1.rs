//! FROST over secp256k1 with SHA-256 challenges
//!
//! Signatures are `R || z`: a 33-byte compressed nonce point followed by a
//! 32-byte scalar. The rerandomized variant signs under `Y + aG` for a fresh
//! per-ceremony randomizer `a`.

use k256::{
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
        Field,
    },
    AffinePoint, ProjectivePoint, Scalar,
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{debug, instrument};

use super::{
    decode_signing_package, encode_signing_package, DealerOutput, KeyShare, PublicKeyPackage,
    Rerandomize, Round1Output, SigningBackend, SigningContext, SigningNonces,
    SigningPackageBundle, SigningPackageOutput, VerifyingShare,
};
use crate::types::{validate_threshold, Commitment, ParticipantId, SignatureShare};
use crate::{Error, Result};

const BINDING_DOMAIN: &[u8] = b"FROST-secp256k1-SHA256-v1rho";
const CHALLENGE_DOMAIN: &[u8] = b"FROST-secp256k1-SHA256-v1chal";

/// secp256k1 backend, optionally rerandomizing
#[derive(Debug, Clone, Copy, Default)]
pub struct Secp256k1Backend {
    rerandomized: bool,
}

impl Secp256k1Backend {
    pub const PLAIN_ID: &'static str = "frost-secp256k1";
    pub const RERANDOMIZED_ID: &'static str = "frost-secp256k1-rerandomized";

    pub fn new() -> Self {
        Self {
            rerandomized: false,
        }
    }

    pub fn rerandomized() -> Self {
        Self { rerandomized: true }
    }
}

impl SigningBackend for Secp256k1Backend {
    fn id(&self) -> &'static str {
        if self.rerandomized {
            Self::RERANDOMIZED_ID
        } else {
            Self::PLAIN_ID
        }
    }

    fn rerandomizer(&self) -> Option<&dyn Rerandomize> {
        if self.rerandomized {
            Some(self)
        } else {
            None
        }
    }

    #[instrument(skip(self), fields(backend = self.id()))]
    fn generate_key_shares(&self, threshold: u16, total: u16) -> Result<DealerOutput> {
        validate_threshold(threshold, total)?;

        let mut rng = OsRng;
        let coefficients: Vec<Scalar> = (0..threshold).map(|_| Scalar::random(&mut rng)).collect();
        let group_public_key = encode_point(&(ProjectivePoint::GENERATOR * coefficients[0]));

        let mut key_shares = Vec::with_capacity(usize::from(total));
        let mut verifying_shares = Vec::with_capacity(usize::from(total));
        for participant_id in 1..=total {
            let secret = evaluate_polynomial(&coefficients, u64::from(participant_id));
            verifying_shares.push(VerifyingShare {
                participant_id,
                key: encode_point(&(ProjectivePoint::GENERATOR * secret)),
            });
            key_shares.push(KeyShare {
                backend_id: self.id().to_string(),
                participant_id,
                threshold,
                total_participants: total,
                secret_share: secret.to_bytes().to_vec(),
                group_public_key: group_public_key.clone(),
            });
        }

        debug!(threshold, total, "Dealt key shares");

        Ok(DealerOutput {
            key_shares,
            public_key_package: PublicKeyPackage {
                backend_id: self.id().to_string(),
                group_public_key,
                verifying_shares,
            },
        })
    }

    fn generate_round1(&self, key_share: &KeyShare) -> Result<Round1Output> {
        self.check_share(key_share)?;

        let mut rng = OsRng;
        let hiding = Scalar::random(&mut rng);
        let binding = Scalar::random(&mut rng);

        let commitment = Commitment {
            participant_id: key_share.participant_id,
            hiding: encode_point(&(ProjectivePoint::GENERATOR * hiding)),
            binding: encode_point(&(ProjectivePoint::GENERATOR * binding)),
        };
        let nonces = SigningNonces::new(
            key_share.participant_id,
            hiding.to_bytes().to_vec(),
            binding.to_bytes().to_vec(),
        );

        Ok(Round1Output { nonces, commitment })
    }

    #[instrument(skip_all, fields(participant = key_share.participant_id))]
    fn generate_round2(
        &self,
        key_share: &KeyShare,
        nonces: &SigningNonces,
        context: &SigningContext,
    ) -> Result<SignatureShare> {
        self.check_share(key_share)?;
        if nonces.participant_id() != key_share.participant_id {
            return Err(Error::Crypto("Nonces belong to another participant".into()));
        }

        let package = self.open_package(context)?;
        let own = package
            .commitments
            .iter()
            .find(|c| c.participant_id == key_share.participant_id)
            .ok_or_else(|| Error::Crypto("Own commitment missing from signing package".into()))?;

        let hiding = decode_scalar(nonces.hiding())?;
        let binding = decode_scalar(nonces.binding())?;
        if encode_point(&(ProjectivePoint::GENERATOR * hiding)) != own.hiding
            || encode_point(&(ProjectivePoint::GENERATOR * binding)) != own.binding
        {
            return Err(Error::Crypto("Nonces do not match the committed values".into()));
        }

        let group_key = self.effective_group_key(&context.group_public_key, package.randomizer.as_deref())?;
        let signing = SigningData::new(&package, &group_key)?;
        let rho = signing.binding_factor(key_share.participant_id)?;
        let lambda = lagrange_coefficient(key_share.participant_id, &signing.signer_ids())?;
        let secret = decode_scalar(&key_share.secret_share)?;

        let z = hiding + binding * rho + lambda * secret * signing.challenge;
        Ok(SignatureShare {
            participant_id: key_share.participant_id,
            share: z.to_bytes().to_vec(),
        })
    }

    #[instrument(skip_all, fields(shares = shares.len()))]
    fn aggregate(
        &self,
        context: &SigningContext,
        shares: &[SignatureShare],
        public_key_package: &PublicKeyPackage,
    ) -> Result<Vec<u8>> {
        if public_key_package.backend_id != self.id() {
            return Err(Error::Crypto(format!(
                "Public key package was dealt for `{}`",
                public_key_package.backend_id
            )));
        }
        if public_key_package.group_public_key != context.group_public_key {
            return Err(Error::Crypto("Group public key mismatch".into()));
        }

        let package = self.open_package(context)?;
        let group_key = self.effective_group_key(&context.group_public_key, package.randomizer.as_deref())?;
        let signing = SigningData::new(&package, &group_key)?;
        let signer_ids = signing.signer_ids();

        let mut submitted = HashSet::new();
        for share in shares {
            if !submitted.insert(share.participant_id) {
                return Err(Error::Crypto(format!(
                    "Duplicate share from participant {}",
                    share.participant_id
                )));
            }
        }
        if submitted != signer_ids.iter().copied().collect::<HashSet<_>>() {
            return Err(Error::Crypto(
                "Shares do not cover exactly the committed signers".into(),
            ));
        }

        let mut z = Scalar::ZERO;
        for share in shares {
            let z_i = decode_scalar(&share.share)?;
            let commitment = package
                .commitments
                .iter()
                .find(|c| c.participant_id == share.participant_id)
                .ok_or_else(|| Error::Crypto("Missing commitment".into()))?;
            let verifying = public_key_package
                .verifying_share(share.participant_id)
                .ok_or_else(|| {
                    Error::Crypto(format!(
                        "No verifying share for participant {}",
                        share.participant_id
                    ))
                })?;

            // z_i G == D_i + rho_i E_i + lambda_i c Y_i
            let rho = signing.binding_factor(share.participant_id)?;
            let lambda = lagrange_coefficient(share.participant_id, &signer_ids)?;
            let expected = decode_point(&commitment.hiding)?
                + decode_point(&commitment.binding)? * rho
                + decode_point(verifying)? * (lambda * signing.challenge);
            if ProjectivePoint::GENERATOR * z_i != expected {
                return Err(Error::Crypto(format!(
                    "Invalid signature share from participant {}",
                    share.participant_id
                )));
            }
            z += z_i;
        }

        if let Some(randomizer) = package.randomizer.as_deref() {
            z += signing.challenge * decode_scalar(randomizer)?;
        }

        let mut signature = encode_point(&signing.group_commitment);
        signature.extend_from_slice(&z.to_bytes());
        Ok(signature)
    }

    fn verify(
        &self,
        group_public_key: &[u8],
        message: &[u8],
        signature: &[u8],
        randomizer: Option<&[u8]>,
    ) -> Result<bool> {
        if signature.len() != 65 {
            return Ok(false);
        }
        if self.rerandomized && randomizer.is_none() {
            return Err(Error::Crypto("Rerandomized verification needs a randomizer".into()));
        }

        let group_key = self.effective_group_key(group_public_key, randomizer)?;
        let r = match decode_point(&signature[..33]) {
            Ok(point) => point,
            Err(_) => return Ok(false),
        };
        let z = decode_scalar(&signature[33..])?;
        let challenge = challenge(&r, &group_key, message);

        Ok(ProjectivePoint::GENERATOR * z == r + group_key * challenge)
    }
}

impl Rerandomize for Secp256k1Backend {
    fn create_signing_package(
        &self,
        message: &[u8],
        commitments: &[Commitment],
        group_public_key: &[u8],
    ) -> Result<SigningPackageOutput> {
        decode_point(group_public_key)?;
        let randomizer = Scalar::random(&mut OsRng).to_bytes().to_vec();
        let signing_package = encode_signing_package(message, commitments, Some(&randomizer))?;
        Ok(SigningPackageOutput {
            signing_package,
            randomizer: Some(randomizer),
        })
    }
}

impl Secp256k1Backend {
    fn check_share(&self, key_share: &KeyShare) -> Result<()> {
        if key_share.backend_id != self.id() {
            return Err(Error::Crypto(format!(
                "Key share was dealt for `{}`, not `{}`",
                key_share.backend_id,
                self.id()
            )));
        }
        Ok(())
    }

    /// Decode the signing package and check it against the context
    fn open_package(&self, context: &SigningContext) -> Result<SigningPackageBundle> {
        let package = decode_signing_package(&context.signing_package)?;
        if package.message != context.message {
            return Err(Error::Crypto("Signing package is for a different message".into()));
        }
        if package.commitments.is_empty() {
            return Err(Error::Crypto("Signing package has no commitments".into()));
        }
        if self.rerandomized {
            match (&package.randomizer, &context.randomizer) {
                (Some(inner), Some(outer)) if inner == outer => {}
                (Some(_), None) => {}
                _ => return Err(Error::Crypto("Randomizer missing or inconsistent".into())),
            }
        } else if package.randomizer.is_some() {
            return Err(Error::Crypto("Unexpected randomizer for plain backend".into()));
        }
        Ok(package)
    }

    fn effective_group_key(&self, group_public_key: &[u8], randomizer: Option<&[u8]>) -> Result<ProjectivePoint> {
        let key = decode_point(group_public_key)?;
        match (self.rerandomized, randomizer) {
            (true, Some(randomizer)) => {
                Ok(key + ProjectivePoint::GENERATOR * decode_scalar(randomizer)?)
            }
            (true, None) => Err(Error::Crypto("Missing randomizer".into())),
            (false, _) => Ok(key),
        }
    }
}

/// Per-package values shared by every signer
struct SigningData<'a> {
    package: &'a SigningPackageBundle,
    group_key_bytes: Vec<u8>,
    group_commitment: ProjectivePoint,
    challenge: Scalar,
}

impl<'a> SigningData<'a> {
    fn new(package: &'a SigningPackageBundle, group_key: &ProjectivePoint) -> Result<Self> {
        let mut data = Self {
            package,
            group_key_bytes: encode_point(group_key),
            group_commitment: ProjectivePoint::IDENTITY,
            challenge: Scalar::ZERO,
        };

        let mut group_commitment = ProjectivePoint::IDENTITY;
        for commitment in &package.commitments {
            let rho = data.binding_factor(commitment.participant_id)?;
            group_commitment = group_commitment
                + decode_point(&commitment.hiding)?
                + decode_point(&commitment.binding)? * rho;
        }

        data.challenge = challenge(&group_commitment, group_key, &package.message);
        data.group_commitment = group_commitment;
        Ok(data)
    }

    fn signer_ids(&self) -> Vec<ParticipantId> {
        self.package.commitments.iter().map(|c| c.participant_id).collect()
    }

    fn binding_factor(&self, participant_id: ParticipantId) -> Result<Scalar> {
        if !self
            .package
            .commitments
            .iter()
            .any(|c| c.participant_id == participant_id)
        {
            return Err(Error::Crypto(format!(
                "Participant {} has no commitment",
                participant_id
            )));
        }

        let mut encoded = Vec::new();
        for commitment in &self.package.commitments {
            encoded.extend_from_slice(&commitment.participant_id.to_be_bytes());
            encoded.extend_from_slice(&commitment.hiding);
            encoded.extend_from_slice(&commitment.binding);
        }

        Ok(hash_to_scalar(
            BINDING_DOMAIN,
            &[
                &participant_id.to_be_bytes(),
                &self.group_key_bytes,
                &self.package.message,
                &encoded,
            ],
        ))
    }
}

fn challenge(group_commitment: &ProjectivePoint, group_key: &ProjectivePoint, message: &[u8]) -> Scalar {
    hash_to_scalar(
        CHALLENGE_DOMAIN,
        &[
            &encode_point(group_commitment),
            &encode_point(group_key),
            message,
        ],
    )
}

/// Length-prefixed SHA-256, reduced mod n
fn hash_to_scalar(domain: &[u8], parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    <Scalar as Reduce<U256>>::reduce_bytes(&hasher.finalize())
}

fn evaluate_polynomial(coefficients: &[Scalar], x: u64) -> Scalar {
    let x_scalar = Scalar::from(x);
    let mut result = Scalar::ZERO;
    let mut x_power = Scalar::ONE;

    for coef in coefficients {
        result += *coef * x_power;
        x_power *= x_scalar;
    }

    result
}

fn lagrange_coefficient(participant_id: ParticipantId, signers: &[ParticipantId]) -> Result<Scalar> {
    let i = u64::from(participant_id);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;

    for &signer in signers {
        let j = u64::from(signer);
        if j != i {
            numerator *= Scalar::from(j);
            let diff = if j > i {
                Scalar::from(j - i)
            } else {
                -Scalar::from(i - j)
            };
            denominator *= diff;
        }
    }

    let inverse: Option<Scalar> = denominator.invert().into();
    inverse
        .map(|inv| numerator * inv)
        .ok_or_else(|| Error::Crypto("Degenerate signer set".into()))
}

fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    let point = k256::EncodedPoint::from_bytes(bytes).map_err(|e| Error::Crypto(e.to_string()))?;
    let affine_opt = AffinePoint::from_encoded_point(&point);
    let affine: AffinePoint = Option::<AffinePoint>::from(affine_opt)
        .ok_or_else(|| Error::Crypto("Invalid curve point".into()))?;
    Ok(ProjectivePoint::from(affine))
}

fn decode_scalar(bytes: &[u8]) -> Result<Scalar> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Crypto("Invalid scalar length".into()))?;
    Ok(<Scalar as Reduce<U256>>::reduce_bytes(&array.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{aggregate_and_verify, build_signing_package};

    struct Signed {
        context: SigningContext,
        shares: Vec<SignatureShare>,
        dealer: DealerOutput,
    }

    fn sign(backend: &Secp256k1Backend, signers: &[ParticipantId], message: &[u8]) -> Signed {
        let dealer = backend.generate_key_shares(2, 3).unwrap();
        let key_of = |id: ParticipantId| &dealer.key_shares[usize::from(id) - 1];

        let round1: Vec<Round1Output> = signers
            .iter()
            .map(|id| backend.generate_round1(key_of(*id)).unwrap())
            .collect();
        let commitments: Vec<Commitment> = round1.iter().map(|r| r.commitment.clone()).collect();

        let group_key = dealer.public_key_package.group_public_key.clone();
        let package = build_signing_package(backend, message, &commitments, &group_key).unwrap();
        let context = SigningContext {
            message: message.to_vec(),
            commitments,
            signing_package: package.signing_package,
            randomizer: package.randomizer,
            group_public_key: group_key,
        };

        let shares = signers
            .iter()
            .zip(&round1)
            .map(|(id, r1)| {
                backend
                    .generate_round2(key_of(*id), &r1.nonces, &context)
                    .unwrap()
            })
            .collect();

        Signed {
            context,
            shares,
            dealer,
        }
    }

    #[test]
    fn test_two_of_three_any_pair() {
        let backend = Secp256k1Backend::new();
        for signers in [[1, 2], [1, 3], [2, 3]] {
            let signed = sign(&backend, &signers, b"transfer 10 sats");
            let output = aggregate_and_verify(
                &backend,
                &signed.context,
                &signed.shares,
                &signed.dealer.public_key_package,
            )
            .unwrap();
            assert!(output.verified, "signers {:?}", signers);
            assert_eq!(output.signature.len(), 65);
        }
    }

    #[test]
    fn test_rerandomized_signature() {
        let backend = Secp256k1Backend::rerandomized();
        let signed = sign(&backend, &[1, 2, 3], b"rerandomized");
        assert!(signed.context.randomizer.is_some());

        let output = aggregate_and_verify(
            &backend,
            &signed.context,
            &signed.shares,
            &signed.dealer.public_key_package,
        )
        .unwrap();
        assert!(output.verified);

        // the signature does not verify under the plain group key
        let plain = Secp256k1Backend::new();
        let group_key = &signed.context.group_public_key;
        assert!(!plain
            .verify(group_key, b"rerandomized", &output.signature, None)
            .unwrap());
    }

    #[test]
    fn test_tampered_share_rejected() {
        let backend = Secp256k1Backend::new();
        let mut signed = sign(&backend, &[1, 2], b"message");
        signed.shares[0].share = Scalar::ONE.to_bytes().to_vec();

        let result = backend.aggregate(
            &signed.context,
            &signed.shares,
            &signed.dealer.public_key_package,
        );
        assert!(matches!(result, Err(Error::Crypto(_))));
    }

    #[test]
    fn test_missing_share_rejected() {
        let backend = Secp256k1Backend::new();
        let signed = sign(&backend, &[1, 2], b"message");
        let result = backend.aggregate(
            &signed.context,
            &signed.shares[..1],
            &signed.dealer.public_key_package,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_wrong_message_fails_verification() {
        let backend = Secp256k1Backend::new();
        let signed = sign(&backend, &[2, 3], b"original");
        let signature = backend
            .aggregate(&signed.context, &signed.shares, &signed.dealer.public_key_package)
            .unwrap();

        let group_key = &signed.context.group_public_key;
        assert!(backend.verify(group_key, b"original", &signature, None).unwrap());
        assert!(!backend.verify(group_key, b"forged", &signature, None).unwrap());
        assert!(!backend.verify(group_key, b"original", &signature[..64], None).unwrap());
    }

    #[test]
    fn test_key_share_for_other_backend_rejected() {
        let dealer = Secp256k1Backend::new().generate_key_shares(2, 2).unwrap();
        let result = Secp256k1Backend::rerandomized().generate_round1(&dealer.key_shares[0]);
        assert!(matches!(result, Err(Error::Crypto(_))));
    }

    #[test]
    fn test_invalid_threshold() {
        assert!(Secp256k1Backend::new().generate_key_shares(1, 3).is_err());
        assert!(Secp256k1Backend::new().generate_key_shares(4, 3).is_err());
    }

    #[test]
    fn test_lagrange_interpolates_secret() {
        let coefficients = [Scalar::from(7u64), Scalar::from(3u64)];
        let signers = [1, 3];
        let mut secret = Scalar::ZERO;
        for id in signers {
            let share = evaluate_polynomial(&coefficients, u64::from(id));
            secret += lagrange_coefficient(id, &signers).unwrap() * share;
        }
        assert_eq!(secret, Scalar::from(7u64));
    }
}
