//! Shared types for the icx client: principals, time and expiry, and the
//! request messages exchanged with replicas.

pub mod messages;
pub mod principal;
pub mod time;

pub use principal::{CanisterId, NodeId, PrincipalId, PrincipalIdError, SubnetId};
pub use time::{Expiry, Time, TimeProvider, TimeSource, UNIX_EPOCH};
