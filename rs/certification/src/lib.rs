//! Decoding and verification of replica certificates.
//!
//! A certificate is a signed, partial view of a subnet's state tree. The
//! verifier reconstructs the tree's root digest, walks the delegation from
//! the network root key to the signing subnet, checks that the target
//! principal is one the subnet is authorised for, and bounds the embedded
//! wall-clock time. Only then are path lookups over the tree exposed.

use icx_tree_hash::MixedHashTree;
use icx_types::messages::Blob;
use serde::{Deserialize, Serialize};

pub mod bls;
pub mod der;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
mod verify;

pub use verify::{
    CertificateError, CertificateScope, CertificateVerifier, VerifiedCertificate,
    DEFAULT_PERMITTED_DRIFT,
};

/// Self-describing CBOR tag bytes; replicas prefix every certificate with
/// them.
const SELF_DESCRIBING_TAG: [u8; 3] = [0xd9, 0xd9, 0xf7];

/// The outer certificate envelope as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub tree: MixedHashTree,
    pub signature: Blob,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation: Option<CertificateDelegation>,
}

/// A root-signed grant of signing authority to a subnet. The embedded
/// certificate advertises the subnet's public key and authorised ranges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CertificateDelegation {
    pub subnet_id: Blob,
    pub certificate: Blob,
}

/// Decodes a certificate, tolerating the self-describing tag prefix.
pub fn decode_certificate(bytes: &[u8]) -> Result<Certificate, CertificateError> {
    serde_cbor::from_slice(strip_self_describing_tag(bytes))
        .map_err(|e| CertificateError::MalformedCbor(e.to_string()))
}

/// Encodes a certificate the way replicas do, tag prefix included.
pub fn encode_certificate(certificate: &Certificate) -> Result<Vec<u8>, CertificateError> {
    let mut bytes = Vec::new();
    let mut serializer = serde_cbor::Serializer::new(&mut bytes);
    serializer
        .self_describe()
        .and_then(|_| certificate.serialize(&mut serializer))
        .map_err(|e| CertificateError::MalformedCbor(e.to_string()))?;
    Ok(bytes)
}

pub(crate) fn strip_self_describing_tag(bytes: &[u8]) -> &[u8] {
    bytes
        .strip_prefix(&SELF_DESCRIBING_TAG[..])
        .unwrap_or(bytes)
}
