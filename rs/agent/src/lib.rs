//! A verifying client for a certified compute network.
//!
//! The [`Agent`] builds, signs, and submits requests, polls accepted
//! updates to a settled status, and verifies every reply against the
//! network root of trust before handing it to the caller: certificates
//! through the delegation chain and freshness window, query replies
//! through per-node signatures.

mod actor;
mod agent;
pub mod cbor;
mod error;
mod http_client;
mod identity;
pub mod poll;
pub mod query;
pub mod transport;

pub use actor::Actor;
pub use agent::{
    Agent, AgentBuilder, CallOptions, CallResult, QueryOptions, QueryResult, SubnetTopology,
};
pub use error::{AgentError, ErrorKind};
pub use http_client::{HttpClient, HttpClientConfig};
pub use identity::{AnonymousIdentity, Ed25519Identity, Identity, SignedRequestAuth};

pub use icx_certification::{CertificateError, CertificateScope, VerifiedCertificate};
pub use icx_types::{CanisterId, PrincipalId, SubnetId};
