//! Builders for synthetic certificates.
//!
//! Everything here signs with throwaway BLS keys derived from fixed seeds;
//! nothing is suitable outside of tests.

use crate::bls::{BLS_PUBLIC_KEY_LENGTH_IN_BYTES, BLS_SIGNATURE_LENGTH_IN_BYTES};
use crate::der::threshold_sig_key_to_der;
use crate::{encode_certificate, Certificate, CertificateDelegation};
use blstrs::{G1Projective, G2Projective, Scalar};
use group::{Curve, Group};
use icx_tree_hash::{Digest, Label, MixedHashTree};
use icx_types::messages::Blob;
use icx_types::{PrincipalId, SubnetId, Time};

const BLS_SIGNATURE_DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_";
const DOMAIN_IC_STATE_ROOT: &[u8; 14] = b"\x0Dic-state-root";

/// A throwaway BLS threshold keypair.
#[derive(Clone)]
pub struct BlsKeypair {
    secret_key: Scalar,
    public_key: [u8; BLS_PUBLIC_KEY_LENGTH_IN_BYTES],
}

impl BlsKeypair {
    pub fn from_seed(seed: u64) -> Self {
        let secret_key = Scalar::from(seed.max(1));
        let public_key = (G2Projective::generator() * secret_key)
            .to_affine()
            .to_compressed();
        Self {
            secret_key,
            public_key,
        }
    }

    pub fn public_key(&self) -> &[u8; BLS_PUBLIC_KEY_LENGTH_IN_BYTES] {
        &self.public_key
    }

    pub fn public_key_der(&self) -> Vec<u8> {
        threshold_sig_key_to_der(&self.public_key)
    }

    /// The self-authenticating subnet principal of this key.
    pub fn subnet_id(&self) -> SubnetId {
        SubnetId::new(PrincipalId::self_authenticating(&self.public_key_der()))
    }

    pub fn sign(&self, message: &[u8]) -> [u8; BLS_SIGNATURE_LENGTH_IN_BYTES] {
        let h = G1Projective::hash_to_curve(message, BLS_SIGNATURE_DST, &[]);
        (h * self.secret_key).to_affine().to_compressed()
    }

    pub fn sign_state_root(&self, root: &Digest) -> Blob {
        let mut message = Vec::with_capacity(DOMAIN_IC_STATE_ROOT.len() + 32);
        message.extend_from_slice(DOMAIN_IC_STATE_ROOT);
        message.extend_from_slice(root.as_bytes());
        Blob(self.sign(&message).to_vec())
    }
}

pub fn fork(left: MixedHashTree, right: MixedHashTree) -> MixedHashTree {
    MixedHashTree::Fork(Box::new((left, right)))
}

/// Left-folds a non-empty list of subtrees into forks. Callers must pass
/// labelled subtrees in label order.
pub fn fork_all(subtrees: Vec<MixedHashTree>) -> MixedHashTree {
    let mut iter = subtrees.into_iter();
    let first = iter.next().expect("fork_all requires at least one subtree");
    iter.fold(first, fork)
}

pub fn labeled(label: impl Into<Label>, subtree: MixedHashTree) -> MixedHashTree {
    MixedHashTree::Labeled(label.into(), Box::new(subtree))
}

pub fn leaf(value: impl Into<Vec<u8>>) -> MixedHashTree {
    MixedHashTree::Leaf(value.into())
}

/// A `/time` leaf: LEB128 of the nanosecond count.
pub fn time_leaf(time: Time) -> MixedHashTree {
    let mut buf = Vec::with_capacity(10);
    leb128::write::unsigned(&mut buf, time.as_nanos_since_unix_epoch())
        .expect("writing to a Vec cannot fail");
    MixedHashTree::Leaf(buf)
}

/// The CBOR encoding of a list of canister ranges.
pub fn encode_ranges(ranges: &[(PrincipalId, PrincipalId)]) -> Vec<u8> {
    let raw: Vec<(serde_bytes::ByteBuf, serde_bytes::ByteBuf)> = ranges
        .iter()
        .map(|(start, end)| {
            (
                serde_bytes::ByteBuf::from(start.as_slice().to_vec()),
                serde_bytes::ByteBuf::from(end.as_slice().to_vec()),
            )
        })
        .collect();
    serde_cbor::to_vec(&raw).expect("failed to encode ranges")
}

/// Assembles and signs certificates over explicit trees.
pub struct CertificateBuilder {
    tree: MixedHashTree,
    keypair: BlsKeypair,
    delegation: Option<CertificateDelegation>,
    corrupt_signature: bool,
}

impl CertificateBuilder {
    pub fn new(tree: MixedHashTree, keypair: &BlsKeypair) -> Self {
        Self {
            tree,
            keypair: keypair.clone(),
            delegation: None,
            corrupt_signature: false,
        }
    }

    /// Attaches a prebuilt delegation envelope.
    pub fn with_delegation(mut self, subnet_id: &SubnetId, delegation_certificate: Vec<u8>) -> Self {
        self.delegation = Some(CertificateDelegation {
            subnet_id: Blob(subnet_id.as_slice().to_vec()),
            certificate: Blob(delegation_certificate),
        });
        self
    }

    /// Flips a signature byte after signing.
    pub fn with_corrupt_signature(mut self) -> Self {
        self.corrupt_signature = true;
        self
    }

    pub fn build(self) -> Certificate {
        let mut signature = self.keypair.sign_state_root(&self.tree.digest());
        if self.corrupt_signature {
            signature.0[0] ^= 0x01;
        }
        Certificate {
            tree: self.tree,
            signature,
            delegation: self.delegation,
        }
    }

    pub fn build_bytes(self) -> Vec<u8> {
        encode_certificate(&self.build()).expect("failed to encode certificate")
    }
}

/// The tree of a delegation certificate: the delegated subnet's public key
/// plus its authorised ranges, in the legacy and/or sharded layout.
pub struct DelegationTreeBuilder {
    subnet_id: SubnetId,
    subnet_key_der: Vec<u8>,
    legacy_ranges: Option<Vec<(PrincipalId, PrincipalId)>>,
    modern_ranges: Option<Vec<(PrincipalId, PrincipalId)>>,
    time: Time,
}

impl DelegationTreeBuilder {
    pub fn new(subnet_id: &SubnetId, subnet_key_der: Vec<u8>, time: Time) -> Self {
        Self {
            subnet_id: subnet_id.clone(),
            subnet_key_der,
            legacy_ranges: None,
            modern_ranges: None,
            time,
        }
    }

    pub fn with_legacy_ranges(mut self, ranges: Vec<(PrincipalId, PrincipalId)>) -> Self {
        self.legacy_ranges = Some(ranges);
        self
    }

    pub fn with_modern_ranges(mut self, ranges: Vec<(PrincipalId, PrincipalId)>) -> Self {
        self.modern_ranges = Some(ranges);
        self
    }

    pub fn build(self) -> MixedHashTree {
        let mut subnet_children = Vec::new();
        if let Some(ranges) = &self.legacy_ranges {
            subnet_children.push(labeled("canister_ranges", leaf(encode_ranges(ranges))));
        }
        subnet_children.push(labeled("public_key", leaf(self.subnet_key_der)));
        let subnet_tree = labeled(
            "subnet",
            labeled(self.subnet_id.as_slice(), fork_all(subnet_children)),
        );

        let mut top = Vec::new();
        if let Some(ranges) = &self.modern_ranges {
            top.push(labeled(
                "canister_ranges",
                labeled(self.subnet_id.as_slice(), leaf(encode_ranges(ranges))),
            ));
        }
        top.push(subnet_tree);
        top.push(labeled("time", time_leaf(self.time)));
        fork_all(top)
    }
}
