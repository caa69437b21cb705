//! The request messages a client sends to a replica, and the
//! representation-independent hashing that names them.

use icx_tree_hash::Path;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Domain separator for request signatures, length byte included.
pub const DOMAIN_IC_REQUEST: &[u8; 11] = b"\x0Aic-request";

/// Domain separator for authentication delegations, length byte included.
pub const DOMAIN_IC_REQUEST_AUTH_DELEGATION: &[u8; 27] = b"\x1Aic-request-auth-delegation";

/// An opaque byte string on the wire.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Blob(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl Blob {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Blob {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

/// The 32-byte fingerprint of a request's content map. Identifies the
/// request across retries and in `request_status` paths.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub [u8; 32]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The byte string an identity signs: the request domain separator
    /// followed by the message id.
    pub fn signable(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(DOMAIN_IC_REQUEST.len() + 32);
        bytes.extend_from_slice(DOMAIN_IC_REQUEST);
        bytes.extend_from_slice(&self.0);
        bytes
    }
}

impl AsRef<[u8]> for MessageId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for MessageId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(self.0))
    }
}

/// A value in a request's canonical content map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawHttpRequestVal {
    Bytes(Vec<u8>),
    String(String),
    U64(u64),
    Array(Vec<RawHttpRequestVal>),
    Map(BTreeMap<String, RawHttpRequestVal>),
}

fn hash_bytes(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

fn hash_val(val: &RawHttpRequestVal) -> [u8; 32] {
    match val {
        RawHttpRequestVal::Bytes(b) => hash_bytes(b),
        RawHttpRequestVal::String(s) => hash_bytes(s.as_bytes()),
        RawHttpRequestVal::U64(n) => {
            let mut buf = Vec::with_capacity(10);
            leb128::write::unsigned(&mut buf, *n).expect("writing to a Vec cannot fail");
            hash_bytes(&buf)
        }
        RawHttpRequestVal::Array(elements) => {
            let mut hasher = Sha256::new();
            for element in elements {
                hasher.update(hash_val(element));
            }
            hasher.finalize().into()
        }
        RawHttpRequestVal::Map(map) => hash_of_map(map),
    }
}

/// The representation-independent hash of a content map: field entries hash
/// to `(SHA-256(key), hash(value))` pairs, which are sorted and hashed as
/// one stream.
pub fn hash_of_map(map: &BTreeMap<String, RawHttpRequestVal>) -> [u8; 32] {
    let mut pairs: Vec<([u8; 32], [u8; 32])> = map
        .iter()
        .map(|(key, value)| (hash_bytes(key.as_bytes()), hash_val(value)))
        .collect();
    pairs.sort_unstable();
    let mut hasher = Sha256::new();
    for (key_hash, value_hash) in pairs {
        hasher.update(key_hash);
        hasher.update(value_hash);
    }
    hasher.finalize().into()
}

fn paths_val(paths: &[Path]) -> RawHttpRequestVal {
    RawHttpRequestVal::Array(
        paths
            .iter()
            .map(|path| {
                RawHttpRequestVal::Array(
                    path.segments()
                        .iter()
                        .map(|segment| RawHttpRequestVal::Bytes(segment.as_bytes().to_vec()))
                        .collect(),
                )
            })
            .collect(),
    )
}

/// An update call as it appears in the request envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpCanisterUpdate {
    pub canister_id: Blob,
    pub method_name: String,
    pub arg: Blob,
    pub sender: Blob,
    pub ingress_expiry: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<Blob>,
}

impl HttpCanisterUpdate {
    pub fn id(&self) -> MessageId {
        let mut map = BTreeMap::from([
            ("request_type".to_string(), RawHttpRequestVal::String("call".to_string())),
            ("canister_id".to_string(), RawHttpRequestVal::Bytes(self.canister_id.0.clone())),
            ("method_name".to_string(), RawHttpRequestVal::String(self.method_name.clone())),
            ("arg".to_string(), RawHttpRequestVal::Bytes(self.arg.0.clone())),
            ("sender".to_string(), RawHttpRequestVal::Bytes(self.sender.0.clone())),
            ("ingress_expiry".to_string(), RawHttpRequestVal::U64(self.ingress_expiry)),
        ]);
        if let Some(nonce) = &self.nonce {
            map.insert("nonce".to_string(), RawHttpRequestVal::Bytes(nonce.0.clone()));
        }
        MessageId(hash_of_map(&map))
    }
}

/// A query as it appears in the request envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpUserQuery {
    pub canister_id: Blob,
    pub method_name: String,
    pub arg: Blob,
    pub sender: Blob,
    pub ingress_expiry: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<Blob>,
}

impl HttpUserQuery {
    pub fn id(&self) -> MessageId {
        let mut map = BTreeMap::from([
            ("request_type".to_string(), RawHttpRequestVal::String("query".to_string())),
            ("canister_id".to_string(), RawHttpRequestVal::Bytes(self.canister_id.0.clone())),
            ("method_name".to_string(), RawHttpRequestVal::String(self.method_name.clone())),
            ("arg".to_string(), RawHttpRequestVal::Bytes(self.arg.0.clone())),
            ("sender".to_string(), RawHttpRequestVal::Bytes(self.sender.0.clone())),
            ("ingress_expiry".to_string(), RawHttpRequestVal::U64(self.ingress_expiry)),
        ]);
        if let Some(nonce) = &self.nonce {
            map.insert("nonce".to_string(), RawHttpRequestVal::Bytes(nonce.0.clone()));
        }
        MessageId(hash_of_map(&map))
    }
}

/// A read-state request as it appears in the request envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpReadState {
    pub sender: Blob,
    pub paths: Vec<Path>,
    pub ingress_expiry: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<Blob>,
}

impl HttpReadState {
    pub fn id(&self) -> MessageId {
        let mut map = BTreeMap::from([
            ("request_type".to_string(), RawHttpRequestVal::String("read_state".to_string())),
            ("sender".to_string(), RawHttpRequestVal::Bytes(self.sender.0.clone())),
            ("paths".to_string(), paths_val(&self.paths)),
            ("ingress_expiry".to_string(), RawHttpRequestVal::U64(self.ingress_expiry)),
        ]);
        if let Some(nonce) = &self.nonce {
            map.insert("nonce".to_string(), RawHttpRequestVal::Bytes(nonce.0.clone()));
        }
        MessageId(hash_of_map(&map))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request_type", rename_all = "snake_case")]
pub enum HttpCallContent {
    Call {
        #[serde(flatten)]
        update: HttpCanisterUpdate,
    },
}

impl HttpCallContent {
    pub fn id(&self) -> MessageId {
        let Self::Call { update } = self;
        update.id()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request_type", rename_all = "snake_case")]
pub enum HttpQueryContent {
    Query {
        #[serde(flatten)]
        query: HttpUserQuery,
    },
}

impl HttpQueryContent {
    pub fn id(&self) -> MessageId {
        let Self::Query { query } = self;
        query.id()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request_type", rename_all = "snake_case")]
pub enum HttpReadStateContent {
    ReadState {
        #[serde(flatten)]
        read_state: HttpReadState,
    },
}

impl HttpReadStateContent {
    pub fn id(&self) -> MessageId {
        let Self::ReadState { read_state } = self;
        read_state.id()
    }
}

/// An authentication delegation from one key to another.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub pubkey: Blob,
    pub expiration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<Blob>>,
}

impl Delegation {
    /// The byte string the delegating key signs.
    pub fn signable(&self) -> Vec<u8> {
        let mut map = BTreeMap::from([
            ("pubkey".to_string(), RawHttpRequestVal::Bytes(self.pubkey.0.clone())),
            ("expiration".to_string(), RawHttpRequestVal::U64(self.expiration)),
        ]);
        if let Some(targets) = &self.targets {
            map.insert(
                "targets".to_string(),
                RawHttpRequestVal::Array(
                    targets.iter().map(|t| RawHttpRequestVal::Bytes(t.0.clone())).collect(),
                ),
            );
        }
        let mut bytes = Vec::new();
        bytes.extend_from_slice(DOMAIN_IC_REQUEST_AUTH_DELEGATION);
        bytes.extend_from_slice(&hash_of_map(&map));
        bytes
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDelegation {
    pub delegation: Delegation,
    pub signature: Blob,
}

/// The outer request envelope posted to the replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestEnvelope<C> {
    pub content: C,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_pubkey: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_sig: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_delegation: Option<Vec<SignedDelegation>>,
}
