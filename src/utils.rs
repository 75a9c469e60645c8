use crate::error::{BlindingError, Result};
use blst::{blst_hash_to_g2, blst_p2, blst_p2_compress};
use blsttc::ff::{Field, PrimeField}; // for Fr trait
use blsttc::group::{CurveAffine, CurveProjective, EncodedPoint};
use blsttc::pairing::bls12_381::{Fr, FrRepr, G2Affine, G2};

/// Domain separation tag of the hash-to-G2 map.
pub(crate) const HASH_TO_G2_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

// blst equivalent of threshold_crypto hash_g2, with an explicit DST.
pub(crate) fn hash_g2_with_dst(msg: &[u8]) -> Result<G2> {
    let mut msg_hash: blst_p2 = Default::default();
    let aug = b"";
    unsafe {
        blst_hash_to_g2(
            &mut msg_hash,
            msg.as_ptr(),
            msg.len(),
            HASH_TO_G2_DST.as_ptr(),
            HASH_TO_G2_DST.len(),
            aug.as_ptr(),
            aug.len(),
        )
    };
    let mut msg_g2_bytes = [0u8; 96];
    unsafe { blst_p2_compress(&mut msg_g2_bytes[0], &msg_hash) }
    be_bytes_to_g2(&msg_g2_bytes)
}

// see blsttc util.rs
pub(crate) fn fr_from_be_bytes(bytes: [u8; 32]) -> Result<Fr> {
    let mut le_bytes = bytes;
    le_bytes.reverse();
    let mut fr_u64s = [0u64; 4];
    for (i, limb) in fr_u64s.iter_mut().enumerate() {
        let mut next_u64_bytes = [0u8; 8];
        next_u64_bytes.copy_from_slice(&le_bytes[i * 8..(i + 1) * 8]);
        *limb = u64::from_le_bytes(next_u64_bytes);
    }
    Fr::from_repr(FrRepr(fr_u64s)).map_err(|_| BlindingError::InvalidPoint)
}

/// Field element for a small integer, e.g. a signer's evaluation point.
pub(crate) fn fr_from_u64(x: u64) -> Fr {
    // a single limb is always below the modulus
    match Fr::from_repr(FrRepr([x, 0, 0, 0])) {
        Ok(fr) => fr,
        Err(_) => unreachable!("u64 is always a canonical field element"),
    }
}

// y = x * r
pub(crate) fn blind(g2: G2, r: Fr) -> G2 {
    g2.into_affine().mul(r)
}

// x = y * 1/r
pub(crate) fn unblind(g2: G2, r: Fr) -> Result<G2> {
    let r_inv = r.inverse().ok_or(BlindingError::ZeroBlindingFactor)?;
    Ok(g2.into_affine().mul(r_inv))
}

// see blsttc Signature from_bytes
pub(crate) fn be_bytes_to_g2(bytes: &[u8; 96]) -> Result<G2> {
    let mut compressed: <G2Affine as CurveAffine>::Compressed = EncodedPoint::empty();
    compressed.as_mut().copy_from_slice(bytes);
    let affine = compressed
        .into_affine()
        .map_err(|_| BlindingError::InvalidPoint)?;
    Ok(affine.into_projective())
}

// see blsttc Signature to_bytes
pub(crate) fn g2_to_be_bytes(g2: G2) -> [u8; 96] {
    let mut bytes = [0u8; 96];
    bytes.copy_from_slice(g2.into_affine().into_compressed().as_ref());
    bytes
}

/// Scalar multiplication of an arbitrary G2 element, which is what a signer
/// does to a blinded message with its key share.
#[cfg(test)]
pub(crate) fn sign_g2(g2: G2, fr: Fr) -> G2 {
    g2.into_affine().mul(fr)
}
