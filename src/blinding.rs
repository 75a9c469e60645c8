use crate::combiner::CombinedSignature;
use crate::error::{BlindingError, Result};
use crate::identifier::{Identifier, PEPPER_SEPARATOR};
use crate::utils::*;
use base64::Engine as _;
use blsttc::ff::Field;
use blsttc::pairing::bls12_381::{Fr, G2};
use blsttc::{PublicKey, SecretKey, Signature};
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of base64 characters of the hashed signature kept as pepper.
pub const PEPPER_CHAR_LENGTH: usize = 13;

/// The identifier hashed to G2 and multiplied by a secret blinding factor.
///
/// Safe to send to every signer: without the factor it reveals nothing about
/// the identifier.
#[derive(Clone, Debug, PartialEq)]
pub struct BlindedMessage {
    point: G2,
}

impl BlindedMessage {
    pub(crate) fn point(&self) -> G2 {
        self.point
    }

    pub fn to_bytes(&self) -> [u8; 96] {
        g2_to_be_bytes(self.point)
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| BlindingError::InvalidInput(format!("invalid base64: {e}")))?;
        Self::try_from(bytes.as_slice())
    }
}

impl From<G2> for BlindedMessage {
    fn from(point: G2) -> Self {
        Self { point }
    }
}

impl TryFrom<&[u8]> for BlindedMessage {
    type Error = BlindingError;

    fn try_from(b: &[u8]) -> Result<Self> {
        let bytes: [u8; 96] = b.try_into()?;
        Ok(Self::from(be_bytes_to_g2(&bytes)?))
    }
}

/// Secret scalar hiding the identifier from the signers.
///
/// Owned by exactly one call: not `Clone`, not serializable, and consumed by
/// [`BlindingCodec::unblind_and_verify`].
pub struct BlindingFactor {
    r: Fr,
}

impl BlindingFactor {
    /// Fresh factor from the OS-seeded generator behind `blsttc`.
    fn random() -> Result<Self> {
        loop {
            let sk = SecretKey::random();
            let r = fr_from_be_bytes(sk.to_bytes())?;
            if !r.is_zero() {
                return Ok(Self { r });
            }
        }
    }

    /// Factor from fixed bytes, for reproducible fixtures.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self> {
        let r = fr_from_be_bytes(bytes)?;
        if r.is_zero() {
            return Err(BlindingError::ZeroBlindingFactor);
        }
        Ok(Self { r })
    }
}

impl fmt::Debug for BlindingFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlindingFactor(omitted)")
    }
}

/// The final hash of an identifier: a BLS signature over
/// `hash_to_g2(identifier)` under the service key.
///
/// Deterministic per identifier and key, unlinkable to the blinded traffic.
#[derive(Clone, Debug, PartialEq)]
pub struct UnblindedSignature {
    signature: Signature,
}

impl UnblindedSignature {
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn to_bytes(&self) -> [u8; 96] {
        self.signature.to_bytes()
    }

    /// Short secret derived from the signature, appended to the identifier
    /// before it is hashed for on-chain use.
    pub fn pepper(&self) -> String {
        let digest = Sha256::digest(self.to_bytes());
        let mut encoded = base64::engine::general_purpose::STANDARD.encode(digest);
        encoded.truncate(PEPPER_CHAR_LENGTH);
        encoded
    }

    /// `0x`-prefixed SHA-256 of `prefix || value || "__" || pepper`.
    pub fn obfuscated_identifier(&self, identifier: &Identifier) -> String {
        let mut hasher = Sha256::new();
        hasher.update(identifier.prefix().as_bytes());
        hasher.update(identifier.value().as_bytes());
        hasher.update(PEPPER_SEPARATOR.as_bytes());
        hasher.update(self.pepper().as_bytes());
        format!("0x{}", hex::encode(hasher.finalize()))
    }
}

/// Client side of the blind signature: blinds identifiers and turns combined
/// blinded signatures back into identifier hashes.
///
/// Holds no state, so one instance serves every concurrent call.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlindingCodec;

impl BlindingCodec {
    pub fn new() -> Self {
        Self
    }

    /// Blinds `identifier` with a fresh random factor.
    pub fn blind(&self, identifier: &Identifier) -> Result<(BlindedMessage, BlindingFactor)> {
        self.blind_with_factor(identifier, BlindingFactor::random()?)
    }

    pub fn blind_with_factor(
        &self,
        identifier: &Identifier,
        factor: BlindingFactor,
    ) -> Result<(BlindedMessage, BlindingFactor)> {
        if identifier.message().is_empty() {
            return Err(BlindingError::InvalidInput("identifier is empty".to_string()));
        }
        let msg_g2 = hash_g2_with_dst(identifier.message())?;
        let blinded_msg = blind(msg_g2, factor.r);
        Ok((BlindedMessage::from(blinded_msg), factor))
    }

    /// Pairing check of a combined signature against the blinded message,
    /// i.e. before unblinding.
    pub fn verify_blinded(
        &self,
        combined: &CombinedSignature,
        blinded: &BlindedMessage,
        pk: &PublicKey,
    ) -> bool {
        // The signers sign the blinded G2 as is, so there is no hashing step
        // here: pair(pk, blinded) == pair(g1, sig)
        pk.verify_g2(combined.signature(), blinded.point())
    }

    /// Removes the blinding factor and checks the result against the
    /// identifier under the service key.
    pub fn unblind_and_verify(
        &self,
        combined: &CombinedSignature,
        factor: BlindingFactor,
        pk: &PublicKey,
        identifier: &Identifier,
    ) -> Result<UnblindedSignature> {
        let blinded_sig_g2 = be_bytes_to_g2(&combined.to_bytes())?;
        let unblinded_sig_g2 = unblind(blinded_sig_g2, factor.r)?;
        drop(factor);

        let signature = Signature::from_bytes(g2_to_be_bytes(unblinded_sig_g2))?;

        // The identifier is preprocessed into G2 the same way it was before
        // blinding: pair(pk, hash_g2(identifier)) == pair(g1, sig)
        let msg_g2 = hash_g2_with_dst(identifier.message())?;
        if !pk.verify_g2(&signature, msg_g2) {
            return Err(BlindingError::SignatureVerification);
        }
        Ok(UnblindedSignature { signature })
    }
}
