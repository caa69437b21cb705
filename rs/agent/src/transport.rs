//! The seam between the request engine and the wire.

use crate::error::AgentError;
use async_trait::async_trait;
use icx_types::{CanisterId, SubnetId};
use tokio::time::Instant;

/// A raw HTTP exchange: the engine interprets status codes, the transport
/// does not.
#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Posts CBOR bodies to replica endpoints. One suspension per round-trip.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(
        &self,
        endpoint: &str,
        body: Vec<u8>,
        deadline: Instant,
    ) -> Result<TransportResponse, AgentError>;

    async fn get(&self, endpoint: &str, deadline: Instant)
        -> Result<TransportResponse, AgentError>;
}

/// The HTTP path for update calls.
pub fn call_path(canister_id: &CanisterId) -> String {
    format!("api/v4/canister/{canister_id}/call")
}

/// The HTTP path for query calls.
pub fn query_path(canister_id: &CanisterId) -> String {
    format!("api/v3/canister/{canister_id}/query")
}

/// The HTTP path for canister read-state requests.
pub fn read_state_path(canister_id: &CanisterId) -> String {
    format!("api/v3/canister/{canister_id}/read_state")
}

/// The HTTP path for subnet read-state requests.
pub fn subnet_read_state_path(subnet_id: &SubnetId) -> String {
    format!("api/v3/subnet/{subnet_id}/read_state")
}

/// The unauthenticated status endpoint.
pub const STATUS_PATH: &str = "api/v2/status";
