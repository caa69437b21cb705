//! Fixed-prefix DER carriers for the two key kinds certificates reference.
//!
//! Both encodings are rigid enough that prefix matching is sufficient; no
//! general ASN.1 machinery is needed.

use crate::bls::BLS_PUBLIC_KEY_LENGTH_IN_BYTES;

/// DER prefix of a BLS12-381 threshold signing public key.
pub const BLS_PUBLIC_KEY_DER_PREFIX: [u8; 37] = [
    48, 129, 130, // A sequence of 130 bytes follows.
    48, 29, // An element of 29 bytes follows.
    6, 13, 43, 6, 1, 4, 1, 130, 220, 124, 5, 3, 1, 2, 1, // Algorithm OID
    6, 12, 43, 6, 1, 4, 1, 130, 220, 124, 5, 3, 2, 1, // Curve OID
    3, 97, 0, // A bitstring of 97 bytes follows, divisible by 8.
];

/// DER prefix of an Ed25519 public key.
pub const ED25519_PUBLIC_KEY_DER_PREFIX: [u8; 12] = [
    48, 42, // A sequence of 42 bytes follows.
    48, 5, // An element of 5 bytes follows.
    6, 3, 43, 101, 112, // The OID
    3, 33, // A bitstring of 33 bytes follows.
    0,  // The bitstring (32 bytes) is divisible by 8.
];

pub const ED25519_PUBLIC_KEY_LENGTH_IN_BYTES: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DerParseError {
    #[error("key is {0} bytes long, expected {1}")]
    WrongLength(usize, usize),
    #[error("key carries an unexpected DER prefix")]
    WrongPrefix,
}

/// Wraps a raw 96-byte threshold signing key in its DER carrier.
pub fn threshold_sig_key_to_der(raw: &[u8; BLS_PUBLIC_KEY_LENGTH_IN_BYTES]) -> Vec<u8> {
    let mut der = BLS_PUBLIC_KEY_DER_PREFIX.to_vec();
    der.extend_from_slice(raw);
    der
}

/// Extracts the raw 96-byte key from a DER-encoded threshold signing key.
pub fn parse_threshold_sig_key_from_der(
    der: &[u8],
) -> Result<[u8; BLS_PUBLIC_KEY_LENGTH_IN_BYTES], DerParseError> {
    let expected = BLS_PUBLIC_KEY_DER_PREFIX.len() + BLS_PUBLIC_KEY_LENGTH_IN_BYTES;
    if der.len() != expected {
        return Err(DerParseError::WrongLength(der.len(), expected));
    }
    let (prefix, raw) = der.split_at(BLS_PUBLIC_KEY_DER_PREFIX.len());
    if prefix != BLS_PUBLIC_KEY_DER_PREFIX {
        return Err(DerParseError::WrongPrefix);
    }
    let mut key = [0u8; BLS_PUBLIC_KEY_LENGTH_IN_BYTES];
    key.copy_from_slice(raw);
    Ok(key)
}

/// Wraps a raw 32-byte Ed25519 public key in its DER carrier.
pub fn ed25519_public_key_to_der(raw: &[u8; ED25519_PUBLIC_KEY_LENGTH_IN_BYTES]) -> Vec<u8> {
    let mut der = ED25519_PUBLIC_KEY_DER_PREFIX.to_vec();
    der.extend_from_slice(raw);
    der
}

/// Extracts the raw 32-byte key from a DER-encoded Ed25519 public key.
pub fn parse_ed25519_key_from_der(
    der: &[u8],
) -> Result<[u8; ED25519_PUBLIC_KEY_LENGTH_IN_BYTES], DerParseError> {
    let expected = ED25519_PUBLIC_KEY_DER_PREFIX.len() + ED25519_PUBLIC_KEY_LENGTH_IN_BYTES;
    if der.len() != expected {
        return Err(DerParseError::WrongLength(der.len(), expected));
    }
    let (prefix, raw) = der.split_at(ED25519_PUBLIC_KEY_DER_PREFIX.len());
    if prefix != ED25519_PUBLIC_KEY_DER_PREFIX {
        return Err(DerParseError::WrongPrefix);
    }
    let mut key = [0u8; ED25519_PUBLIC_KEY_LENGTH_IN_BYTES];
    key.copy_from_slice(raw);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn should_round_trip_threshold_sig_keys() {
        let raw = [7u8; 96];
        let der = threshold_sig_key_to_der(&raw);
        assert_eq!(der.len(), 133);
        assert_eq!(parse_threshold_sig_key_from_der(&der), Ok(raw));
    }

    #[test]
    fn should_round_trip_ed25519_keys() {
        let raw = [9u8; 32];
        let der = ed25519_public_key_to_der(&raw);
        assert_eq!(der.len(), 44);
        assert_eq!(parse_ed25519_key_from_der(&der), Ok(raw));
    }

    #[test]
    fn should_reject_wrong_lengths() {
        assert_matches!(
            parse_threshold_sig_key_from_der(&[0u8; 96]),
            Err(DerParseError::WrongLength(96, 133))
        );
        assert_matches!(
            parse_ed25519_key_from_der(&[0u8; 32]),
            Err(DerParseError::WrongLength(32, 44))
        );
    }

    #[test]
    fn should_reject_foreign_prefixes() {
        let mut der = threshold_sig_key_to_der(&[7u8; 96]);
        der[4] ^= 1;
        assert_matches!(parse_threshold_sig_key_from_der(&der), Err(DerParseError::WrongPrefix));
    }
}
