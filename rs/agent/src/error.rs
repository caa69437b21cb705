//! The engine's error taxonomy.
//!
//! Every error carries a kind that drives the retry controller: transient
//! failures retry with backoff, an ingress-expiry rejection triggers a
//! single time sync, trust failures surface immediately except for the
//! freshness class, which retries through the normal counter.

use icx_certification::CertificateError;

/// Classification of an [`AgentError`], orthogonal to the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed caller-supplied value; never retried.
    Input,
    /// The replica response violates the wire contract; never retried.
    Protocol,
    /// Certificate or response-signature verification failed.
    Trust,
    /// Transport failure or server-side 5xx; retried with backoff.
    Transient,
    /// Replica-side clock disagreement; triggers one time sync.
    IngressExpiryInvalid,
    /// The caller aborted the operation.
    Cancelled,
    /// Catch-all, always surfaced with context.
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("replica response violates the wire contract: {0}")]
    ProtocolViolation(String),

    #[error("call rejected: code {reject_code}, {reject_message}")]
    CallRejected {
        reject_code: u64,
        reject_message: String,
        error_code: Option<String>,
    },

    #[error("certificate verification failed: {0}")]
    Trust(#[from] CertificateError),

    #[error("query response is not trusted: {0}")]
    QueryNotTrusted(String),

    #[error("response timestamp is outside the freshness window: {0}")]
    CertificateOutdated(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("replica returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("replica rejected the ingress expiry: {0}")]
    IngressExpiryRejected(String),

    #[error("request {request_id} did not settle before the deadline")]
    IngressTimeout { request_id: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("identity failed to sign: {0}")]
    SigningFailed(String),

    #[error("{0}")]
    Unknown(String),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::InvalidArgument(_) | AgentError::SigningFailed(_) => ErrorKind::Input,
            AgentError::ProtocolViolation(_) | AgentError::CallRejected { .. } => {
                ErrorKind::Protocol
            }
            AgentError::Trust(_)
            | AgentError::QueryNotTrusted(_)
            | AgentError::CertificateOutdated(_) => ErrorKind::Trust,
            AgentError::Transport(_) | AgentError::IngressTimeout { .. } => ErrorKind::Transient,
            AgentError::Http { status, .. } => {
                if *status >= 500 {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Protocol
                }
            }
            AgentError::IngressExpiryRejected(_) => ErrorKind::IngressExpiryInvalid,
            AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Whether the retry controller may re-issue the request for this error.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// The freshness class of trust failures: retried through the normal
    /// counter because a rebuild recomputes the expiry against the current
    /// clock.
    pub fn is_outdated_trust(&self) -> bool {
        matches!(
            self,
            AgentError::CertificateOutdated(_)
                | AgentError::Trust(
                    CertificateError::Stale { .. } | CertificateError::FromFuture { .. }
                )
        )
    }
}
