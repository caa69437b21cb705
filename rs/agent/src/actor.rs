//! A thin binding of an agent to one canister.

use crate::agent::{Agent, CallOptions, QueryOptions};
use crate::error::AgentError;
use icx_types::CanisterId;
use std::sync::Arc;

/// Dispatches typed method calls to a fixed canister. Argument encoding and
/// reply decoding stay with the caller.
#[derive(Clone)]
pub struct Actor {
    agent: Arc<Agent>,
    canister_id: CanisterId,
}

impl Actor {
    pub fn new(agent: Arc<Agent>, canister_id: CanisterId) -> Self {
        Self { agent, canister_id }
    }

    pub fn canister_id(&self) -> &CanisterId {
        &self.canister_id
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Issues an update call and returns the raw reply blob.
    pub async fn update(&self, method_name: &str, arg: Vec<u8>) -> Result<Vec<u8>, AgentError> {
        self.agent
            .call(&self.canister_id, method_name, arg, CallOptions::default())
            .await
            .map(|result| result.reply)
    }

    /// Issues a query and returns the raw reply blob.
    pub async fn query(&self, method_name: &str, arg: Vec<u8>) -> Result<Vec<u8>, AgentError> {
        self.agent
            .query(&self.canister_id, method_name, arg, QueryOptions::default())
            .await
            .map(|result| result.reply)
    }
}
