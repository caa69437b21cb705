//! Principals: the opaque identifiers of users, canisters, subnets, and
//! nodes, together with their checksummed textual form.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};
use std::fmt;
use std::str::FromStr;

/// Maximum length of a principal's raw form.
pub const MAX_PRINCIPAL_LENGTH_IN_BYTES: usize = 29;

const TYPE_SELF_AUTHENTICATING: u8 = 0x02;
const TYPE_ANONYMOUS: u8 = 0x04;

const BASE32_ALPHABET: base32::Alphabet = base32::Alphabet::RFC4648 { padding: false };

/// An opaque identifier, 0 to 29 bytes of raw form.
///
/// Raw forms order lexicographically; subnet authorisation ranges rely on
/// this ordering.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct PrincipalId(#[serde(with = "serde_bytes")] Vec<u8>);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PrincipalIdError {
    #[error("principal is {0} bytes long, more than the maximum of {MAX_PRINCIPAL_LENGTH_IN_BYTES}")]
    TooLong(usize),
    #[error("principal text is not valid base32")]
    NotBase32,
    #[error("principal text is shorter than its checksum")]
    TooShort,
    #[error("principal text checksum mismatch")]
    WrongChecksum,
    #[error("principal text is not in canonical form, expected {expected}")]
    NotCanonical { expected: String },
}

impl PrincipalId {
    /// Builds a principal from its raw form.
    pub fn new(raw: Vec<u8>) -> Result<Self, PrincipalIdError> {
        if raw.len() > MAX_PRINCIPAL_LENGTH_IN_BYTES {
            return Err(PrincipalIdError::TooLong(raw.len()));
        }
        Ok(Self(raw))
    }

    /// The anonymous principal: a single `0x04` byte.
    pub fn anonymous() -> Self {
        Self(vec![TYPE_ANONYMOUS])
    }

    /// The self-authenticating principal of a DER-encoded public key:
    /// `SHA-224(der) ‖ 0x02`, 29 bytes.
    pub fn self_authenticating(der_public_key: &[u8]) -> Self {
        let mut raw: Vec<u8> = Sha224::digest(der_public_key).to_vec();
        raw.push(TYPE_SELF_AUTHENTICATING);
        Self(raw)
    }

    /// The management pseudo-canister: the empty raw form.
    pub fn management_canister() -> Self {
        Self(Vec::new())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 == [TYPE_ANONYMOUS]
    }

    /// Renders the checksummed text form: lowercase base32 of
    /// `CRC32(raw) ‖ raw`, a dash after every five characters.
    pub fn to_text(&self) -> String {
        let mut checksummed = crc32fast::hash(&self.0).to_be_bytes().to_vec();
        checksummed.extend_from_slice(&self.0);
        let encoded = base32::encode(BASE32_ALPHABET, &checksummed).to_lowercase();
        let mut grouped = String::with_capacity(encoded.len() + encoded.len() / 5);
        for (i, c) in encoded.chars().enumerate() {
            if i > 0 && i % 5 == 0 {
                grouped.push('-');
            }
            grouped.push(c);
        }
        grouped
    }

    /// Parses the text form. Only the canonical rendering is accepted, so
    /// `from_str(p.to_text()) == p` is total and deterministic.
    pub fn from_text(text: &str) -> Result<Self, PrincipalIdError> {
        let ungrouped: String = text.chars().filter(|c| *c != '-').collect();
        let checksummed = base32::decode(BASE32_ALPHABET, &ungrouped.to_uppercase())
            .ok_or(PrincipalIdError::NotBase32)?;
        if checksummed.len() < 4 {
            return Err(PrincipalIdError::TooShort);
        }
        let (checksum, raw) = checksummed.split_at(4);
        if checksum != crc32fast::hash(raw).to_be_bytes() {
            return Err(PrincipalIdError::WrongChecksum);
        }
        let principal = Self::new(raw.to_vec())?;
        let canonical = principal.to_text();
        if canonical != text {
            return Err(PrincipalIdError::NotCanonical { expected: canonical });
        }
        Ok(principal)
    }
}

impl TryFrom<&[u8]> for PrincipalId {
    type Error = PrincipalIdError;

    fn try_from(raw: &[u8]) -> Result<Self, Self::Error> {
        Self::new(raw.to_vec())
    }
}

impl TryFrom<Vec<u8>> for PrincipalId {
    type Error = PrincipalIdError;

    fn try_from(raw: Vec<u8>) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl FromStr for PrincipalId {
    type Err = PrincipalIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_text(s)
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

impl fmt::Debug for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

macro_rules! principal_wrapper {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
        )]
        pub struct $name(PrincipalId);

        impl $name {
            pub const fn new(principal: PrincipalId) -> Self {
                Self(principal)
            }

            pub fn get(&self) -> &PrincipalId {
                &self.0
            }

            pub fn into_principal(self) -> PrincipalId {
                self.0
            }

            pub fn as_slice(&self) -> &[u8] {
                self.0.as_slice()
            }
        }

        impl From<PrincipalId> for $name {
            fn from(principal: PrincipalId) -> Self {
                Self(principal)
            }
        }

        impl FromStr for $name {
            type Err = PrincipalIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(PrincipalId::from_text(s)?))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

principal_wrapper!(CanisterId, "The principal of a canister, the target of calls.");
principal_wrapper!(SubnetId, "The principal of a subnet, a signing group of nodes.");
principal_wrapper!(NodeId, "The principal of a single replica node.");

impl CanisterId {
    /// The management pseudo-canister.
    pub fn management() -> Self {
        Self(PrincipalId::management_canister())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn should_render_known_principals() {
        assert_eq!(PrincipalId::management_canister().to_text(), "aaaaa-aa");
        assert_eq!(PrincipalId::anonymous().to_text(), "2vxsx-fae");
    }

    #[test]
    fn should_round_trip_known_canister_ids() {
        for text in [
            "uxrrr-q7777-77774-qaaaq-cai",
            "v2nog-2aaaa-aaaab-p777q-cai",
            "jrlun-jiaaa-aaaab-aaaaa-cai",
        ] {
            let principal = PrincipalId::from_text(text).expect("failed to parse principal");
            assert_eq!(principal.to_text(), text);
        }
    }

    #[test]
    fn should_reject_tampered_text() {
        assert_matches!(
            PrincipalId::from_text("uxrrr-q7777-77774-qaaaq-caj"),
            Err(PrincipalIdError::WrongChecksum | PrincipalIdError::NotCanonical { .. })
        );
    }

    #[test]
    fn should_reject_non_canonical_grouping() {
        let principal = PrincipalId::anonymous();
        let ungrouped: String = principal.to_text().chars().filter(|c| *c != '-').collect();
        assert_matches!(
            PrincipalId::from_text(&ungrouped),
            Err(PrincipalIdError::NotCanonical { .. })
        );
    }

    #[test]
    fn should_reject_uppercase_text() {
        let text = PrincipalId::anonymous().to_text().to_uppercase();
        assert_matches!(
            PrincipalId::from_text(&text),
            Err(PrincipalIdError::NotCanonical { .. })
        );
    }

    #[test]
    fn should_reject_overlong_raw_forms() {
        assert_matches!(
            PrincipalId::new(vec![0u8; 30]),
            Err(PrincipalIdError::TooLong(30))
        );
    }

    #[test]
    fn should_build_self_authenticating_principals() {
        let principal = PrincipalId::self_authenticating(b"a public key");
        assert_eq!(principal.as_slice().len(), 29);
        assert_eq!(principal.as_slice()[28], 0x02);
    }

    proptest! {
        #[test]
        fn text_round_trip_is_identity(raw in proptest::collection::vec(any::<u8>(), 0..=29)) {
            let principal = PrincipalId::new(raw).unwrap();
            let reparsed = PrincipalId::from_text(&principal.to_text()).unwrap();
            prop_assert_eq!(principal, reparsed);
        }
    }
}
