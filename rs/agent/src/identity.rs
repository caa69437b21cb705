//! Identities that sign requests on the caller's behalf.

use crate::error::AgentError;
use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use icx_certification::der::ed25519_public_key_to_der;
use icx_types::messages::MessageId;
use icx_types::PrincipalId;

/// The material an identity attaches to a request envelope. Anonymous
/// identities attach nothing.
#[derive(Clone, Debug, Default)]
pub struct SignedRequestAuth {
    pub public_key_der: Option<Vec<u8>>,
    pub signature: Option<Vec<u8>>,
}

/// Signs request ids and names the sender principal.
///
/// Signing is a suspension point: implementations may defer to hardware or
/// remote signers.
#[async_trait]
pub trait Identity: Send + Sync {
    /// The principal requests are sent as.
    fn sender(&self) -> PrincipalId;

    /// Signs the request id under the request signing domain.
    async fn sign(&self, message_id: &MessageId) -> Result<SignedRequestAuth, AgentError>;
}

/// The anonymous identity: sender `0x04`, no signature.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnonymousIdentity;

#[async_trait]
impl Identity for AnonymousIdentity {
    fn sender(&self) -> PrincipalId {
        PrincipalId::anonymous()
    }

    async fn sign(&self, _message_id: &MessageId) -> Result<SignedRequestAuth, AgentError> {
        Ok(SignedRequestAuth::default())
    }
}

/// An Ed25519 keypair identity with a self-authenticating sender.
pub struct Ed25519Identity {
    signing_key: SigningKey,
    public_key_der: Vec<u8>,
    sender: PrincipalId,
}

impl Ed25519Identity {
    pub fn new(signing_key: SigningKey) -> Self {
        let public_key_der = ed25519_public_key_to_der(&signing_key.verifying_key().to_bytes());
        let sender = PrincipalId::self_authenticating(&public_key_der);
        Self {
            signing_key,
            public_key_der,
            sender,
        }
    }

    pub fn from_secret_key_bytes(secret: &[u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(secret))
    }

    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }
}

#[async_trait]
impl Identity for Ed25519Identity {
    fn sender(&self) -> PrincipalId {
        self.sender.clone()
    }

    async fn sign(&self, message_id: &MessageId) -> Result<SignedRequestAuth, AgentError> {
        let signature = self.signing_key.sign(&message_id.signable());
        Ok(SignedRequestAuth {
            public_key_der: Some(self.public_key_der.clone()),
            signature: Some(signature.to_bytes().to_vec()),
        })
    }
}
