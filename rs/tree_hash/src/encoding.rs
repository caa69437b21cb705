//! The wire encoding of partial state trees.
//!
//! A tree serialises as nested arrays tagged by the variant number:
//! `[0]`, `[1, left, right]`, `[2, label, subtree]`, `[3, bytes]`,
//! `[4, digest]`. Labels and leaf contents are byte strings and must be
//! preserved byte-for-byte; any normalisation would change the root digest.

use crate::{Digest, Label, MixedHashTree};
use serde::de::{self, Deserialize, Deserializer, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_bytes::{ByteBuf, Bytes};
use std::fmt;

impl Serialize for MixedHashTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MixedHashTree::Empty => {
                let mut seq = serializer.serialize_seq(Some(1))?;
                seq.serialize_element(&0u8)?;
                seq.end()
            }
            MixedHashTree::Fork(fork) => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(&1u8)?;
                seq.serialize_element(&fork.0)?;
                seq.serialize_element(&fork.1)?;
                seq.end()
            }
            MixedHashTree::Labeled(label, subtree) => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(&2u8)?;
                seq.serialize_element(Bytes::new(label.as_bytes()))?;
                seq.serialize_element(subtree)?;
                seq.end()
            }
            MixedHashTree::Leaf(value) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(&3u8)?;
                seq.serialize_element(Bytes::new(value))?;
                seq.end()
            }
            MixedHashTree::Pruned(digest) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(&4u8)?;
                seq.serialize_element(Bytes::new(digest.as_ref()))?;
                seq.end()
            }
        }
    }
}

struct TreeVisitor;

impl<'de> Visitor<'de> for TreeVisitor {
    type Value = MixedHashTree;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a hash tree encoded as a tagged array")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let tag: u8 = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let tree = match tag {
            0 => MixedHashTree::Empty,
            1 => {
                let left: MixedHashTree = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let right: MixedHashTree = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                MixedHashTree::Fork(Box::new((left, right)))
            }
            2 => {
                let label: ByteBuf = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let subtree: MixedHashTree = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                MixedHashTree::Labeled(Label::from(label.into_vec()), Box::new(subtree))
            }
            3 => {
                let value: ByteBuf = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                MixedHashTree::Leaf(value.into_vec())
            }
            4 => {
                let digest: ByteBuf = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let digest: [u8; 32] = digest.into_vec().try_into().map_err(|bytes: Vec<u8>| {
                    de::Error::invalid_length(bytes.len(), &"a 32-byte digest")
                })?;
                MixedHashTree::Pruned(Digest(digest))
            }
            other => {
                return Err(de::Error::invalid_value(
                    de::Unexpected::Unsigned(other as u64),
                    &"a tree variant tag in 0..=4",
                ))
            }
        };
        // Trailing elements would silently change the hash: reject them.
        if seq.next_element::<de::IgnoredAny>()?.is_some() {
            return Err(de::Error::custom("trailing elements in tree node"));
        }
        Ok(tree)
    }
}

impl<'de> Deserialize<'de> for MixedHashTree {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(TreeVisitor)
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.as_bytes())
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = ByteBuf::deserialize(deserializer)?;
        Ok(Label::from(bytes.into_vec()))
    }
}

impl Serialize for crate::Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.segments().len()))?;
        for segment in self.segments() {
            seq.serialize_element(segment)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for crate::Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let segments = Vec::<Label>::deserialize(deserializer)?;
        Ok(crate::Path::new(segments))
    }
}
