use crate::error::CombineError;
use crate::types::{PartialSignature, Quorum, SignerIndex};
use crate::utils::*;
use blsttc::ff::Field;
use blsttc::group::{CurveAffine, CurveProjective};
use blsttc::pairing::bls12_381::{Fr, G2};
use blsttc::Signature;
use std::collections::BTreeSet;

/// Blinded threshold signature reconstructed from `t` partial signatures.
///
/// Any valid `t`-subset of shares yields the same signature.
#[derive(Clone, Debug, PartialEq)]
pub struct CombinedSignature {
    signature: Signature,
}

impl CombinedSignature {
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn to_bytes(&self) -> [u8; 96] {
        self.signature.to_bytes()
    }
}

impl From<Signature> for CombinedSignature {
    fn from(signature: Signature) -> Self {
        Self { signature }
    }
}

/// Computes the Lagrange coefficients at `x = 0` for the given signer indices.
///
/// Signer `k` contributes the evaluation at `x = k`, so the coefficient of
/// signer `i` is `Π_{j != i} x_j / (x_j - x_i)`.
pub fn lagrange_coefficients(indices: &[SignerIndex]) -> Result<Vec<Fr>, CombineError> {
    let mut seen = BTreeSet::new();
    for index in indices {
        if !seen.insert(*index) {
            return Err(CombineError::DuplicateSignerIndex(*index));
        }
    }

    let mut coefficients = Vec::with_capacity(indices.len());
    for i in indices {
        let x_i = fr_from_u64(u64::from(i.get()));
        let mut num = Fr::one();
        let mut den = Fr::one();
        for j in indices.iter().filter(|j| *j != i) {
            let x_j = fr_from_u64(u64::from(j.get()));
            num.mul_assign(&x_j);
            let mut diff = x_j;
            diff.sub_assign(&x_i);
            den.mul_assign(&diff);
        }
        // distinct indices never give a zero denominator
        let den_inv = den.inverse().ok_or(CombineError::DuplicateSignerIndex(*i))?;
        num.mul_assign(&den_inv);
        coefficients.push(num);
    }
    Ok(coefficients)
}

/// Reconstructs threshold signatures from exactly `t` partial signatures.
#[derive(Clone, Copy, Debug)]
pub struct ThresholdCombiner {
    quorum: Quorum,
}

impl ThresholdCombiner {
    pub fn new(quorum: Quorum) -> Self {
        Self { quorum }
    }

    pub fn quorum(&self) -> Quorum {
        self.quorum
    }

    /// Combines `subset` by Lagrange interpolation in G2.
    ///
    /// The subset must hold exactly `t` shares so that the result never
    /// depends on which extra shares happened to be present. Mismatched key
    /// versions fail before any group operation. The result still has to be
    /// checked with [`BlindingCodec::verify_blinded`](crate::BlindingCodec::verify_blinded).
    pub fn combine(&self, subset: &[PartialSignature]) -> Result<CombinedSignature, CombineError> {
        let t = self.quorum.t();
        if subset.len() != t {
            return Err(CombineError::WrongSubsetSize {
                expected: t,
                got: subset.len(),
            });
        }
        if let Some(out_of_range) = subset
            .iter()
            .map(|p| p.signer_index)
            .find(|idx| !self.quorum.contains(*idx))
        {
            return Err(CombineError::SignerIndexOutOfRange {
                index: out_of_range,
                n: self.quorum.n(),
            });
        }

        let versions: BTreeSet<u32> = subset.iter().map(|p| p.key_version).collect();
        if versions.len() > 1 {
            return Err(CombineError::InconsistentShareVersions(
                versions.into_iter().collect(),
            ));
        }

        let indices: Vec<SignerIndex> = subset.iter().map(|p| p.signer_index).collect();
        let coefficients = lagrange_coefficients(&indices)?;

        let mut combined = G2::zero();
        for (share, coefficient) in subset.iter().zip(coefficients) {
            let point = be_bytes_to_g2(&share.bytes)
                .map_err(|_| CombineError::InvalidShare(share.signer_index))?;
            combined.add_assign(&point.into_affine().mul(coefficient));
        }

        let signature = Signature::from_bytes(g2_to_be_bytes(combined))
            .map_err(|_| CombineError::InvalidShare(indices[0]))?;
        Ok(CombinedSignature { signature })
    }
}
