//! A scripted in-memory replica for driving the engine end to end.

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use icx_agent::cbor::decode_body;
use icx_agent::transport::{Transport, TransportResponse};
use icx_agent::AgentError;
use icx_certification::der::ed25519_public_key_to_der;
use icx_certification::test_utils::{
    fork_all, labeled, leaf, time_leaf, BlsKeypair, CertificateBuilder, DelegationTreeBuilder,
};
use icx_types::messages::{
    hash_of_map, HttpQueryContent, HttpReadStateContent, HttpRequestEnvelope, RawHttpRequestVal,
};
use icx_types::{CanisterId, NodeId, PrincipalId, SubnetId, Time};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::time::Instant;

const DOMAIN_IC_RESPONSE: &[u8; 12] = b"\x0Bic-response";

pub fn canister(text: &str) -> CanisterId {
    text.parse::<CanisterId>().expect("bad canister id")
}

/// One node, one subnet, one canister; every response signed correctly.
pub struct MockReplica {
    root: BlsKeypair,
    subnet: BlsKeypair,
    subnet_id: SubnetId,
    ranges: Vec<(PrincipalId, PrincipalId)>,
    node_id: NodeId,
    node_key: SigningKey,
    /// The wall clock as this replica sees it.
    pub replica_time: Time,
    /// The blob returned for queries and settled calls.
    pub reply_blob: Vec<u8>,

    pub query_count: AtomicUsize,
    pub time_read_count: AtomicUsize,
    pub subnet_read_count: AtomicUsize,
    pub status_read_count: AtomicUsize,
    pub call_count: AtomicUsize,
    pub last_call_expiry: AtomicU64,
}

impl MockReplica {
    pub fn new(replica_time: Time, hosted: &CanisterId) -> Self {
        Self::with_ranges(
            replica_time,
            vec![(hosted.get().clone(), hosted.get().clone())],
        )
    }

    pub fn with_ranges(replica_time: Time, ranges: Vec<(PrincipalId, PrincipalId)>) -> Self {
        let node_key = SigningKey::from_bytes(&[3; 32]);
        Self {
            root: BlsKeypair::from_seed(42),
            subnet: BlsKeypair::from_seed(7),
            subnet_id: SubnetId::new(PrincipalId::new(vec![0xaa; 29]).unwrap()),
            ranges,
            node_id: NodeId::new(PrincipalId::new(vec![0x11; 10]).unwrap()),
            node_key,
            replica_time,
            reply_blob: b"Hello, world!".to_vec(),
            query_count: AtomicUsize::new(0),
            time_read_count: AtomicUsize::new(0),
            subnet_read_count: AtomicUsize::new(0),
            status_read_count: AtomicUsize::new(0),
            call_count: AtomicUsize::new(0),
            last_call_expiry: AtomicU64::new(0),
        }
    }

    pub fn root_public_key_der(&self) -> Vec<u8> {
        self.root.public_key_der()
    }

    pub fn read_state_count(&self) -> usize {
        self.time_read_count.load(Ordering::SeqCst)
            + self.subnet_read_count.load(Ordering::SeqCst)
            + self.status_read_count.load(Ordering::SeqCst)
    }

    fn delegation_bytes(&self) -> Vec<u8> {
        let tree = DelegationTreeBuilder::new(
            &self.subnet_id,
            self.subnet.public_key_der(),
            self.replica_time,
        )
        .with_legacy_ranges(self.ranges.clone())
        .build();
        CertificateBuilder::new(tree, &self.root).build_bytes()
    }

    fn certificate_response(&self, tree: icx_tree_hash::MixedHashTree) -> TransportResponse {
        let certificate = CertificateBuilder::new(tree, &self.subnet)
            .with_delegation(&self.subnet_id, self.delegation_bytes())
            .build_bytes();
        cbor_ok(&ReadStateBody {
            certificate: serde_bytes::ByteBuf::from(certificate),
        })
    }

    fn handle_read_state(&self, body: &[u8]) -> TransportResponse {
        let envelope: HttpRequestEnvelope<HttpReadStateContent> =
            decode_body(body).expect("malformed read_state envelope");
        let HttpReadStateContent::ReadState { read_state } = &envelope.content;
        let first_path = read_state.paths.first().expect("read_state without paths");
        match first_path.segments()[0].as_bytes() {
            s if s == b"time" => {
                self.time_read_count.fetch_add(1, Ordering::SeqCst);
                self.certificate_response(labeled("time", time_leaf(self.replica_time)))
            }
            s if s == b"subnet" => {
                self.subnet_read_count.fetch_add(1, Ordering::SeqCst);
                let node_der =
                    ed25519_public_key_to_der(&self.node_key.verifying_key().to_bytes());
                let tree = fork_all(vec![
                    labeled(
                        "subnet",
                        labeled(
                            self.subnet_id.as_slice(),
                            fork_all(vec![
                                labeled(
                                    "node",
                                    labeled(
                                        self.node_id.as_slice(),
                                        labeled("public_key", leaf(node_der)),
                                    ),
                                ),
                                labeled("public_key", leaf(self.subnet.public_key_der())),
                            ]),
                        ),
                    ),
                    labeled("time", time_leaf(self.replica_time)),
                ]);
                self.certificate_response(tree)
            }
            s if s == b"request_status" => {
                self.status_read_count.fetch_add(1, Ordering::SeqCst);
                let request_id = first_path.segments()[1].as_bytes().to_vec();
                let tree = fork_all(vec![
                    labeled(
                        "request_status",
                        labeled(
                            request_id,
                            fork_all(vec![
                                labeled("reply", leaf(self.reply_blob.clone())),
                                labeled("status", leaf("replied")),
                            ]),
                        ),
                    ),
                    labeled("time", time_leaf(self.replica_time)),
                ]);
                self.certificate_response(tree)
            }
            other => panic!("unexpected read_state path {other:?}"),
        }
    }

    fn handle_query(&self, body: &[u8]) -> TransportResponse {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        let envelope: HttpRequestEnvelope<HttpQueryContent> =
            decode_body(body).expect("malformed query envelope");
        let request_id = envelope.content.id();
        let timestamp = self.replica_time.as_nanos_since_unix_epoch();

        let response_hash = hash_of_map(&BTreeMap::from([
            (
                "status".to_string(),
                RawHttpRequestVal::String("replied".to_string()),
            ),
            (
                "reply".to_string(),
                RawHttpRequestVal::Map(BTreeMap::from([(
                    "arg".to_string(),
                    RawHttpRequestVal::Bytes(self.reply_blob.clone()),
                )])),
            ),
            ("timestamp".to_string(), RawHttpRequestVal::U64(timestamp)),
            (
                "request_id".to_string(),
                RawHttpRequestVal::Bytes(request_id.as_bytes().to_vec()),
            ),
        ]));
        let mut signable = Vec::with_capacity(DOMAIN_IC_RESPONSE.len() + 32);
        signable.extend_from_slice(DOMAIN_IC_RESPONSE);
        signable.extend_from_slice(&response_hash);
        let signature = self.node_key.sign(&signable);

        cbor_ok(&QueryBody {
            status: "replied".to_string(),
            reply: ReplyBody {
                arg: serde_bytes::ByteBuf::from(self.reply_blob.clone()),
            },
            signatures: vec![SignatureBody {
                timestamp,
                signature: serde_bytes::ByteBuf::from(signature.to_bytes().to_vec()),
                identity: serde_bytes::ByteBuf::from(self.node_id.as_slice().to_vec()),
            }],
        })
    }

    fn handle_call(&self, body: &[u8]) -> TransportResponse {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let envelope: HttpRequestEnvelope<icx_types::messages::HttpCallContent> =
            decode_body(body).expect("malformed call envelope");
        let icx_types::messages::HttpCallContent::Call { update } = &envelope.content;
        self.last_call_expiry
            .store(update.ingress_expiry, Ordering::SeqCst);
        TransportResponse {
            status: 202,
            body: Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for MockReplica {
    async fn post(
        &self,
        endpoint: &str,
        body: Vec<u8>,
        _deadline: Instant,
    ) -> Result<TransportResponse, AgentError> {
        if endpoint.ends_with("/query") {
            Ok(self.handle_query(&body))
        } else if endpoint.ends_with("/read_state") {
            Ok(self.handle_read_state(&body))
        } else if endpoint.ends_with("/call") {
            Ok(self.handle_call(&body))
        } else {
            panic!("unexpected endpoint {endpoint}")
        }
    }

    async fn get(
        &self,
        endpoint: &str,
        _deadline: Instant,
    ) -> Result<TransportResponse, AgentError> {
        panic!("unexpected GET to {endpoint}")
    }
}

#[derive(Serialize)]
struct ReadStateBody {
    certificate: serde_bytes::ByteBuf,
}

#[derive(Serialize)]
struct ReplyBody {
    arg: serde_bytes::ByteBuf,
}

#[derive(Serialize)]
struct SignatureBody {
    timestamp: u64,
    signature: serde_bytes::ByteBuf,
    identity: serde_bytes::ByteBuf,
}

#[derive(Serialize)]
struct QueryBody {
    status: String,
    reply: ReplyBody,
    signatures: Vec<SignatureBody>,
}

fn cbor_ok<T: Serialize>(body: &T) -> TransportResponse {
    TransportResponse {
        status: 200,
        body: serde_cbor::to_vec(body).expect("failed to encode mock response"),
    }
}
