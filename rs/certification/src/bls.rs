//! BLS12-381 signature verification for state roots.
//!
//! Subnets sign with keys in G2 and produce signatures in G1, hashed to the
//! curve with the standard ciphersuite.

use blstrs::{pairing, G1Affine, G1Projective, G2Affine};
use group::prime::PrimeCurveAffine;
use group::Curve;

/// Hash-to-curve domain separation tag of the G1 signature ciphersuite.
const BLS_SIGNATURE_DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_";

pub const BLS_SIGNATURE_LENGTH_IN_BYTES: usize = 48;
pub const BLS_PUBLIC_KEY_LENGTH_IN_BYTES: usize = 96;

/// Verifies a compressed G1 signature over `message` under a compressed G2
/// public key. Returns `false` for any malformed point.
pub fn verify_bls_signature(
    signature: &[u8; BLS_SIGNATURE_LENGTH_IN_BYTES],
    message: &[u8],
    public_key: &[u8; BLS_PUBLIC_KEY_LENGTH_IN_BYTES],
) -> bool {
    let signature = match Option::<G1Affine>::from(G1Affine::from_compressed(signature)) {
        Some(point) => point,
        None => return false,
    };
    let public_key = match Option::<G2Affine>::from(G2Affine::from_compressed(public_key)) {
        Some(point) => point,
        None => return false,
    };
    let message_point = G1Projective::hash_to_curve(message, BLS_SIGNATURE_DST, &[]);
    pairing(&signature, &G2Affine::generator())
        == pairing(&message_point.to_affine(), &public_key)
}
