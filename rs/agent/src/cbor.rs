//! CBOR framing of request envelopes and replica response bodies.

use crate::error::AgentError;
use crate::identity::SignedRequestAuth;
use icx_types::messages::{Blob, HttpRequestEnvelope};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const SELF_DESCRIBING_TAG: [u8; 3] = [0xd9, 0xd9, 0xf7];

/// Encodes a request envelope, prefixed with the self-describing tag the
/// replica expects.
pub fn encode_envelope<C: Serialize>(
    content: C,
    auth: SignedRequestAuth,
) -> Result<Vec<u8>, AgentError> {
    let envelope = HttpRequestEnvelope {
        content,
        sender_pubkey: auth.public_key_der.map(Blob),
        sender_sig: auth.signature.map(Blob),
        sender_delegation: None,
    };
    let mut bytes = Vec::new();
    let mut serializer = serde_cbor::Serializer::new(&mut bytes);
    serializer
        .self_describe()
        .and_then(|_| envelope.serialize(&mut serializer))
        .map_err(|e| AgentError::ProtocolViolation(format!("failed to encode envelope: {e}")))?;
    Ok(bytes)
}

/// Decodes a CBOR response body, tolerating the self-describing tag.
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, AgentError> {
    let bytes = bytes
        .strip_prefix(&SELF_DESCRIBING_TAG[..])
        .unwrap_or(bytes);
    serde_cbor::from_slice(bytes)
        .map_err(|e| AgentError::ProtocolViolation(format!("failed to decode response: {e}")))
}

/// Body of a read-state response.
#[derive(Debug, Deserialize)]
pub struct ReadStateResponse {
    pub certificate: Blob,
}

/// Body of a synchronous call response: either a certificate over the
/// settled request status, or a non-replicated rejection.
#[derive(Debug, Deserialize)]
pub struct CallResponse {
    pub status: Option<String>,
    pub certificate: Option<Blob>,
    pub reject_code: Option<u64>,
    pub reject_message: Option<String>,
    pub error_code: Option<String>,
}

/// One node's signature over a query response.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeSignature {
    pub timestamp: u64,
    pub signature: Blob,
    pub identity: Blob,
}

#[derive(Debug, Deserialize)]
pub struct QueryReply {
    pub arg: Blob,
}

/// Body of a query response.
#[derive(Debug, Deserialize)]
pub struct QueryResponse {
    pub status: String,
    pub reply: Option<QueryReply>,
    pub reject_code: Option<u64>,
    pub reject_message: Option<String>,
    pub error_code: Option<String>,
    #[serde(default)]
    pub signatures: Vec<NodeSignature>,
}

/// Body of the unauthenticated status endpoint.
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub root_key: Option<Blob>,
    pub impl_version: Option<String>,
    pub replica_health_status: Option<String>,
}
