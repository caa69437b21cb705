//! The certificate verification algorithm.

use crate::bls::{self, BLS_SIGNATURE_LENGTH_IN_BYTES};
use crate::der;
use crate::{decode_certificate, strip_self_describing_tag, Certificate, CertificateDelegation};
use icx_tree_hash::{Label, LookupStatus, MixedHashTree, Path, SubtreeLookupStatus};
use icx_types::{CanisterId, NodeId, PrincipalId, SubnetId, Time, TimeProvider, TimeSource};
use serde_bytes::ByteBuf;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Domain separator for state-root signatures, length byte included.
const DOMAIN_IC_STATE_ROOT: &[u8; 14] = b"\x0Dic-state-root";

/// How far a certificate's embedded time may deviate from the local clock.
pub const DEFAULT_PERMITTED_DRIFT: Duration = Duration::from_secs(5 * 60);

/// The principal a certificate is expected to speak for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CertificateScope {
    Canister(CanisterId),
    Subnet(SubnetId),
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CertificateError {
    #[error("failed to decode certificate: {0}")]
    MalformedCbor(String),
    #[error("certificate signature does not verify under the effective signing key")]
    BadSignature,
    #[error("certificate signature is malformed: {0}")]
    MalformedSignature(String),
    #[error("effective signing key is malformed: {0}")]
    MalformedSigningKey(#[from] der::DerParseError),
    #[error("certificate time lags the local clock by {lag_ms}ms, permitted drift is {permitted_ms}ms")]
    Stale { lag_ms: u64, permitted_ms: u64 },
    #[error("certificate time leads the local clock by {lead_ms}ms, permitted drift is {permitted_ms}ms")]
    FromFuture { lead_ms: u64, permitted_ms: u64 },
    #[error("canister {canister_id} is outside the subnet's authorised ranges")]
    NotInRanges { canister_id: CanisterId },
    #[error("certificate speaks for {found}, expected {expected}")]
    WrongRootDelegation { expected: PrincipalId, found: PrincipalId },
    #[error("a delegation certificate may not itself delegate")]
    NestedDelegation,
    #[error("lookup of {path} failed: {reason}")]
    LookupFailed { path: String, reason: String },
}

fn lookup_failed(path: &Path, reason: impl Into<String>) -> CertificateError {
    CertificateError::LookupFailed {
        path: format!("{path:?}"),
        reason: reason.into(),
    }
}

/// Verifies certificates against a fixed network root of trust.
pub struct CertificateVerifier {
    root_public_key_der: Vec<u8>,
    permitted_drift: Duration,
    disable_time_verification: bool,
    time_source: Arc<dyn TimeSource>,
}

impl CertificateVerifier {
    pub fn new(root_public_key_der: Vec<u8>) -> Self {
        Self {
            root_public_key_der,
            permitted_drift: DEFAULT_PERMITTED_DRIFT,
            disable_time_verification: false,
            time_source: Arc::new(TimeProvider::SystemTime),
        }
    }

    pub fn with_permitted_drift(mut self, permitted_drift: Duration) -> Self {
        self.permitted_drift = permitted_drift;
        self
    }

    pub fn with_time_verification_disabled(mut self, disabled: bool) -> Self {
        self.disable_time_verification = disabled;
        self
    }

    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    pub fn root_public_key_der(&self) -> &[u8] {
        &self.root_public_key_der
    }

    /// The principal of the subnet the root key authenticates directly.
    pub fn root_subnet_id(&self) -> SubnetId {
        SubnetId::new(PrincipalId::self_authenticating(&self.root_public_key_der))
    }

    /// Decodes and verifies a certificate for `scope`.
    ///
    /// `drift_ms` is the caller's current estimate of how far its clock is
    /// behind the network; it shifts the freshness window, not the
    /// signature checks.
    pub fn verify(
        &self,
        certificate_bytes: &[u8],
        scope: &CertificateScope,
        drift_ms: i64,
    ) -> Result<VerifiedCertificate, CertificateError> {
        let certificate = decode_certificate(certificate_bytes)?;
        self.verify_certificate(certificate, scope, drift_ms)
    }

    pub fn verify_certificate(
        &self,
        certificate: Certificate,
        scope: &CertificateScope,
        drift_ms: i64,
    ) -> Result<VerifiedCertificate, CertificateError> {
        let (signing_key_der, signing_subnet) = match &certificate.delegation {
            Some(delegation) => self.verify_delegation(delegation, scope)?,
            None => {
                let root_subnet = self.root_subnet_id();
                match scope {
                    CertificateScope::Subnet(subnet_id) if subnet_id != &root_subnet => {
                        return Err(CertificateError::WrongRootDelegation {
                            expected: subnet_id.get().clone(),
                            found: root_subnet.into_principal(),
                        })
                    }
                    CertificateScope::Canister(canister_id) => {
                        // Root-subnet certificates advertise ranges only in
                        // newer replica versions; enforce them when present.
                        if let Some(ranges) =
                            lookup_canister_ranges(&certificate.tree, &root_subnet)?
                        {
                            check_ranges(&ranges, canister_id)?;
                        }
                    }
                    _ => {}
                }
                (self.root_public_key_der.clone(), root_subnet)
            }
        };
        self.check_signature(&certificate, &signing_key_der)?;
        let time = certificate_time(&certificate.tree)?;
        if !self.disable_time_verification {
            self.check_freshness(time, drift_ms)?;
        }
        Ok(VerifiedCertificate {
            tree: certificate.tree,
            time,
            signing_subnet,
        })
    }

    /// Verifies the root-signed delegation and returns the delegated
    /// subnet's DER signing key.
    fn verify_delegation(
        &self,
        delegation: &CertificateDelegation,
        scope: &CertificateScope,
    ) -> Result<(Vec<u8>, SubnetId), CertificateError> {
        let inner = decode_certificate(delegation.certificate.as_slice())?;
        if inner.delegation.is_some() {
            return Err(CertificateError::NestedDelegation);
        }
        let subnet_id = SubnetId::new(
            PrincipalId::new(delegation.subnet_id.as_slice().to_vec())
                .map_err(|e| CertificateError::MalformedCbor(e.to_string()))?,
        );
        if let CertificateScope::Subnet(expected) = scope {
            if expected != &subnet_id {
                return Err(CertificateError::WrongRootDelegation {
                    expected: expected.get().clone(),
                    found: subnet_id.into_principal(),
                });
            }
        }
        self.check_signature(&inner, &self.root_public_key_der)?;
        // Delegations are long-lived; their embedded time is not bounded.
        // The management pseudo-canister lives in no range by construction
        // and is exempt from containment.
        if let CertificateScope::Canister(canister_id) = scope {
            if !canister_id.as_slice().is_empty() {
                let ranges_path = modern_ranges_path(&subnet_id);
                let ranges = lookup_canister_ranges(&inner.tree, &subnet_id)?.ok_or_else(|| {
                    lookup_failed(&ranges_path, "no authorised ranges in delegation")
                })?;
                check_ranges(&ranges, canister_id)?;
            }
        }
        let key_path = Path::new(vec![
            Label::from("subnet"),
            Label::from(subnet_id.as_slice()),
            Label::from("public_key"),
        ]);
        match inner.tree.lookup_path(&key_path) {
            LookupStatus::Found(key_der) => Ok((key_der.to_vec(), subnet_id)),
            other => Err(lookup_failed(&key_path, format!("{other:?}"))),
        }
    }

    fn check_signature(
        &self,
        certificate: &Certificate,
        signing_key_der: &[u8],
    ) -> Result<(), CertificateError> {
        let public_key = der::parse_threshold_sig_key_from_der(signing_key_der)?;
        let signature: &[u8; BLS_SIGNATURE_LENGTH_IN_BYTES] = certificate
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| {
                CertificateError::MalformedSignature(format!(
                    "signature is {} bytes, expected {}",
                    certificate.signature.as_slice().len(),
                    BLS_SIGNATURE_LENGTH_IN_BYTES
                ))
            })?;
        let root_hash = certificate.tree.digest();
        let mut message = Vec::with_capacity(DOMAIN_IC_STATE_ROOT.len() + 32);
        message.extend_from_slice(DOMAIN_IC_STATE_ROOT);
        message.extend_from_slice(root_hash.as_bytes());
        if !bls::verify_bls_signature(signature, &message, &public_key) {
            return Err(CertificateError::BadSignature);
        }
        Ok(())
    }

    fn check_freshness(&self, certificate_time: Time, drift_ms: i64) -> Result<(), CertificateError> {
        let now_ms = self.time_source.current_time().as_millis_since_unix_epoch() as i64 + drift_ms;
        let certificate_ms = certificate_time.as_millis_since_unix_epoch() as i64;
        let permitted_ms = self.permitted_drift.as_millis() as i64;
        if certificate_ms < now_ms - permitted_ms {
            return Err(CertificateError::Stale {
                lag_ms: (now_ms - certificate_ms) as u64,
                permitted_ms: permitted_ms as u64,
            });
        }
        if certificate_ms > now_ms + permitted_ms {
            return Err(CertificateError::FromFuture {
                lead_ms: (certificate_ms - now_ms) as u64,
                permitted_ms: permitted_ms as u64,
            });
        }
        Ok(())
    }
}

/// A certificate that passed verification: lookups are now trustworthy.
#[derive(Debug)]
pub struct VerifiedCertificate {
    tree: MixedHashTree,
    time: Time,
    signing_subnet: SubnetId,
}

impl VerifiedCertificate {
    pub fn tree(&self) -> &MixedHashTree {
        &self.tree
    }

    /// The certificate's embedded wall-clock time.
    pub fn time(&self) -> Time {
        self.time
    }

    /// The subnet whose key signed this certificate.
    pub fn signing_subnet(&self) -> &SubnetId {
        &self.signing_subnet
    }

    pub fn lookup(&self, path: &Path) -> LookupStatus<'_> {
        self.tree.lookup_path(path)
    }

    pub fn lookup_subtree(&self, path: &Path) -> SubtreeLookupStatus<'_> {
        self.tree.lookup_subtree(path)
    }

    /// Looks up a value that must be present.
    pub fn lookup_value(&self, path: &Path) -> Result<&[u8], CertificateError> {
        match self.tree.lookup_path(path) {
            LookupStatus::Found(value) => Ok(value),
            other => Err(lookup_failed(path, format!("{other:?}"))),
        }
    }

    /// Collects the DER node signing keys advertised under
    /// `/subnet/<subnet_id>/node/<node_id>/public_key`.
    pub fn subnet_node_keys(
        &self,
        subnet_id: &SubnetId,
    ) -> Result<BTreeMap<NodeId, Vec<u8>>, CertificateError> {
        let nodes_path = Path::new(vec![
            Label::from("subnet"),
            Label::from(subnet_id.as_slice()),
            Label::from("node"),
        ]);
        let subtree = match self.tree.lookup_subtree(&nodes_path) {
            SubtreeLookupStatus::Found(subtree) => subtree,
            other => return Err(lookup_failed(&nodes_path, format!("{other:?}"))),
        };
        let mut keys = BTreeMap::new();
        let public_key_path = Path::new(vec![Label::from("public_key")]);
        for (label, node_tree) in subtree.flatten_forks() {
            let node_id = NodeId::new(
                PrincipalId::new(label.as_bytes().to_vec())
                    .map_err(|e| lookup_failed(&nodes_path, e.to_string()))?,
            );
            match node_tree.lookup_path(&public_key_path) {
                LookupStatus::Found(key_der) => {
                    keys.insert(node_id, key_der.to_vec());
                }
                other => return Err(lookup_failed(&nodes_path, format!("{other:?}"))),
            }
        }
        Ok(keys)
    }

    /// The ranges this certificate's tree advertises for `subnet_id`.
    pub fn canister_ranges(
        &self,
        subnet_id: &SubnetId,
    ) -> Result<Option<Vec<(PrincipalId, PrincipalId)>>, CertificateError> {
        lookup_canister_ranges(&self.tree, subnet_id)
    }
}

fn modern_ranges_path(subnet_id: &SubnetId) -> Path {
    Path::new(vec![
        Label::from("canister_ranges"),
        Label::from(subnet_id.as_slice()),
    ])
}

fn legacy_ranges_path(subnet_id: &SubnetId) -> Path {
    Path::new(vec![
        Label::from("subnet"),
        Label::from(subnet_id.as_slice()),
        Label::from("canister_ranges"),
    ])
}

/// Reads the subnet's authorised ranges, preferring the sharded
/// `/canister_ranges/<sid>` layout and falling back to the legacy
/// `/subnet/<sid>/canister_ranges` leaf. When both are present the modern
/// layout wins.
fn lookup_canister_ranges(
    tree: &MixedHashTree,
    subnet_id: &SubnetId,
) -> Result<Option<Vec<(PrincipalId, PrincipalId)>>, CertificateError> {
    let modern = modern_ranges_path(subnet_id);
    match tree.lookup_subtree(&modern) {
        SubtreeLookupStatus::Found(MixedHashTree::Leaf(bytes)) => {
            decode_ranges(bytes, &modern).map(Some)
        }
        SubtreeLookupStatus::Found(subtree) => {
            let mut ranges = Vec::new();
            for (_, shard) in subtree.flatten_forks() {
                match shard {
                    MixedHashTree::Leaf(bytes) => ranges.extend(decode_ranges(bytes, &modern)?),
                    MixedHashTree::Pruned(_) => {}
                    other => {
                        return Err(lookup_failed(&modern, format!("unexpected shard {other:?}")))
                    }
                }
            }
            Ok(Some(ranges))
        }
        SubtreeLookupStatus::Error(e) => Err(lookup_failed(&modern, e.to_string())),
        SubtreeLookupStatus::Absent | SubtreeLookupStatus::Unknown => {
            let legacy = legacy_ranges_path(subnet_id);
            match tree.lookup_path(&legacy) {
                LookupStatus::Found(bytes) => decode_ranges(bytes, &legacy).map(Some),
                LookupStatus::Absent | LookupStatus::Unknown => Ok(None),
                LookupStatus::Error(e) => Err(lookup_failed(&legacy, e.to_string())),
            }
        }
    }
}

fn decode_ranges(
    bytes: &[u8],
    path: &Path,
) -> Result<Vec<(PrincipalId, PrincipalId)>, CertificateError> {
    let raw: Vec<(ByteBuf, ByteBuf)> = serde_cbor::from_slice(strip_self_describing_tag(bytes))
        .map_err(|e| lookup_failed(path, e.to_string()))?;
    raw.into_iter()
        .map(|(start, end)| {
            Ok((
                PrincipalId::new(start.into_vec())
                    .map_err(|e| lookup_failed(path, e.to_string()))?,
                PrincipalId::new(end.into_vec()).map_err(|e| lookup_failed(path, e.to_string()))?,
            ))
        })
        .collect()
}

fn check_ranges(
    ranges: &[(PrincipalId, PrincipalId)],
    canister_id: &CanisterId,
) -> Result<(), CertificateError> {
    if canister_id.as_slice().is_empty() {
        return Ok(());
    }
    let target = canister_id.get();
    if ranges.iter().any(|(start, end)| start <= target && target <= end) {
        Ok(())
    } else {
        Err(CertificateError::NotInRanges {
            canister_id: canister_id.clone(),
        })
    }
}

fn certificate_time(tree: &MixedHashTree) -> Result<Time, CertificateError> {
    let time_path = Path::new(vec![Label::from("time")]);
    match tree.lookup_path(&time_path) {
        LookupStatus::Found(mut leaf) => {
            let nanos = leb128::read::unsigned(&mut leaf)
                .map_err(|e| lookup_failed(&time_path, e.to_string()))?;
            Ok(Time::from_nanos_since_unix_epoch(nanos))
        }
        other => Err(lookup_failed(&time_path, format!("{other:?}"))),
    }
}
