//! Verification of node-signed query responses.
//!
//! Queries are not certified by the subnet key; instead every replying node
//! signs the response body together with its own timestamp and the request
//! id. All returned signatures must verify under keys from the subnet's
//! current node-key map.

use crate::cbor::QueryResponse;
use crate::error::AgentError;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use icx_certification::der::parse_ed25519_key_from_der;
use icx_types::messages::{hash_of_map, MessageId, RawHttpRequestVal};
use icx_types::{NodeId, PrincipalId};
use std::collections::BTreeMap;

/// Domain separator for query response signatures, length byte included.
const DOMAIN_IC_RESPONSE: &[u8; 12] = b"\x0Bic-response";

/// The byte string a node signs for this response and timestamp.
fn response_signable(
    response: &QueryResponse,
    request_id: &MessageId,
    timestamp: u64,
) -> Result<Vec<u8>, AgentError> {
    let mut map = BTreeMap::from([
        ("status".to_string(), RawHttpRequestVal::String(response.status.clone())),
        ("timestamp".to_string(), RawHttpRequestVal::U64(timestamp)),
        (
            "request_id".to_string(),
            RawHttpRequestVal::Bytes(request_id.as_bytes().to_vec()),
        ),
    ]);
    match response.status.as_str() {
        "replied" => {
            let reply = response.reply.as_ref().ok_or_else(|| {
                AgentError::ProtocolViolation("replied query response without a reply".to_string())
            })?;
            map.insert(
                "reply".to_string(),
                RawHttpRequestVal::Map(BTreeMap::from([(
                    "arg".to_string(),
                    RawHttpRequestVal::Bytes(reply.arg.as_slice().to_vec()),
                )])),
            );
        }
        "rejected" => {
            let reject_code = response.reject_code.ok_or_else(|| {
                AgentError::ProtocolViolation("rejected query response without a code".to_string())
            })?;
            map.insert("reject_code".to_string(), RawHttpRequestVal::U64(reject_code));
            map.insert(
                "reject_message".to_string(),
                RawHttpRequestVal::String(response.reject_message.clone().unwrap_or_default()),
            );
            if let Some(error_code) = &response.error_code {
                map.insert(
                    "error_code".to_string(),
                    RawHttpRequestVal::String(error_code.clone()),
                );
            }
        }
        other => {
            return Err(AgentError::ProtocolViolation(format!(
                "unexpected query response status {other:?}"
            )))
        }
    }
    let mut signable = Vec::with_capacity(DOMAIN_IC_RESPONSE.len() + 32);
    signable.extend_from_slice(DOMAIN_IC_RESPONSE);
    signable.extend_from_slice(&hash_of_map(&map));
    Ok(signable)
}

/// Checks every node signature on `response` against the subnet's key map.
pub fn verify_node_signatures(
    response: &QueryResponse,
    request_id: &MessageId,
    node_keys: &BTreeMap<NodeId, Vec<u8>>,
) -> Result<(), AgentError> {
    if response.signatures.is_empty() {
        return Err(AgentError::QueryNotTrusted(
            "response carries no node signatures".to_string(),
        ));
    }
    for node_signature in &response.signatures {
        let node_id = NodeId::new(
            PrincipalId::new(node_signature.identity.as_slice().to_vec())
                .map_err(|e| AgentError::QueryNotTrusted(format!("malformed node id: {e}")))?,
        );
        let key_der = node_keys.get(&node_id).ok_or_else(|| {
            AgentError::QueryNotTrusted(format!(
                "node {node_id} is not a member of the target subnet"
            ))
        })?;
        let raw_key = parse_ed25519_key_from_der(key_der)
            .map_err(|e| AgentError::QueryNotTrusted(format!("bad key for node {node_id}: {e}")))?;
        let verifying_key = VerifyingKey::from_bytes(&raw_key)
            .map_err(|e| AgentError::QueryNotTrusted(format!("bad key for node {node_id}: {e}")))?;
        let signature_bytes: [u8; 64] =
            node_signature.signature.as_slice().try_into().map_err(|_| {
                AgentError::QueryNotTrusted(format!(
                    "signature from node {node_id} is not 64 bytes"
                ))
            })?;
        let signable = response_signable(response, request_id, node_signature.timestamp)?;
        verifying_key
            .verify(&signable, &Signature::from_bytes(&signature_bytes))
            .map_err(|_| {
                AgentError::QueryNotTrusted(format!(
                    "signature from node {node_id} does not verify"
                ))
            })?;
    }
    Ok(())
}

/// Rejects responses whose node timestamps fall outside the freshness
/// window around the drift-corrected clock. Runs before any key fetch, so a
/// skewed client fails fast without extra round-trips.
pub fn check_signature_freshness(
    response: &QueryResponse,
    corrected_now_ms: i64,
    max_age_ms: i64,
) -> Result<(), AgentError> {
    for node_signature in &response.signatures {
        let timestamp_ms = (node_signature.timestamp / 1_000_000) as i64;
        if timestamp_ms < corrected_now_ms - max_age_ms {
            return Err(AgentError::CertificateOutdated(format!(
                "node timestamp lags the local clock by {}ms",
                corrected_now_ms - timestamp_ms
            )));
        }
        if timestamp_ms > corrected_now_ms + max_age_ms {
            return Err(AgentError::CertificateOutdated(format!(
                "node timestamp leads the local clock by {}ms",
                timestamp_ms - corrected_now_ms
            )));
        }
    }
    Ok(())
}
