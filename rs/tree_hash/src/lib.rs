//! Merkle hash trees as they appear in replica certificates.
//!
//! A certificate carries a partial (pruned) view of the replica state tree.
//! This crate recomputes the root digest of such a view and answers labelled
//! path lookups over it, distinguishing values that are present, provably
//! absent, or pruned away.

use sha2::{Digest as _, Sha256};
use std::cmp::Ordering;
use std::fmt;

mod encoding;

const DOMAIN_HASHTREE_EMPTY: &str = "ic-hashtree-empty";
const DOMAIN_HASHTREE_FORK: &str = "ic-hashtree-fork";
const DOMAIN_HASHTREE_LABELED: &str = "ic-hashtree-labeled";
const DOMAIN_HASHTREE_LEAF: &str = "ic-hashtree-leaf";

/// A 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Digest {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The label of an edge in the state tree. An ordered byte string; most
/// labels on the wire are ASCII but principals and request ids appear raw.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label(Vec<u8>);

impl Label {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Label {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Label {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for Label {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for Label {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => write!(f, "{s}"),
            _ => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

/// A path from the root of the state tree to a labelled node.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Path(Vec<Label>);

impl Path {
    pub fn new(segments: Vec<Label>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[Label] {
        &self.0
    }
}

impl From<Vec<Label>> for Path {
    fn from(segments: Vec<Label>) -> Self {
        Self(segments)
    }
}

impl From<Label> for Path {
    fn from(label: Label) -> Self {
        Self(vec![label])
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            write!(f, "/{segment:?}")?;
        }
        Ok(())
    }
}

/// A partial state tree: the five-case sum the wire encodes.
///
/// `Pruned` stands in for a subtree the replica omitted; its digest still
/// participates in root reconstruction, so pruning cannot forge contents.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum MixedHashTree {
    Empty,
    Fork(Box<(MixedHashTree, MixedHashTree)>),
    Labeled(Label, Box<MixedHashTree>),
    Leaf(Vec<u8>),
    Pruned(Digest),
}

/// Outcome of looking up a concrete value in a partial tree.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum LookupStatus<'a> {
    /// The value is present in the tree.
    Found(&'a [u8]),
    /// The tree proves the path does not exist.
    Absent,
    /// The tree neither contains the path nor proves its absence; the
    /// relevant subtree was pruned.
    Unknown,
    /// The tree shape contradicts the request.
    Error(LookupError),
}

/// Outcome of looking up a subtree rather than a leaf value.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum SubtreeLookupStatus<'a> {
    Found(&'a MixedHashTree),
    Absent,
    Unknown,
    Error(LookupError),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, thiserror::Error)]
pub enum LookupError {
    /// A leaf was reached while path segments remained.
    #[error("encountered a leaf with path segments remaining")]
    UnexpectedLeaf,
    /// The path ends on an interior node where a value was requested.
    #[error("path does not end at a leaf")]
    NotALeaf,
}

enum SearchResult<'a> {
    Found(&'a MixedHashTree),
    Absent,
    Unknown,
    Error(LookupError),
}

impl MixedHashTree {
    /// Recomputes the root digest. Pruned nodes contribute their stored
    /// digest verbatim, so the result equals the digest of the full tree
    /// whenever the partial view is honest.
    pub fn digest(&self) -> Digest {
        match self {
            Self::Empty => domain_hash(DOMAIN_HASHTREE_EMPTY, &[]),
            Self::Fork(fork) => {
                let mut hasher = domain_hasher(DOMAIN_HASHTREE_FORK);
                hasher.update(fork.0.digest().as_bytes());
                hasher.update(fork.1.digest().as_bytes());
                finish(hasher)
            }
            Self::Labeled(label, subtree) => {
                let mut hasher = domain_hasher(DOMAIN_HASHTREE_LABELED);
                hasher.update(label.as_bytes());
                hasher.update(subtree.digest().as_bytes());
                finish(hasher)
            }
            Self::Leaf(value) => {
                let mut hasher = domain_hasher(DOMAIN_HASHTREE_LEAF);
                hasher.update(value);
                finish(hasher)
            }
            Self::Pruned(digest) => *digest,
        }
    }

    /// Looks up the leaf value at `path`.
    pub fn lookup_path<'a>(&'a self, path: &Path) -> LookupStatus<'a> {
        match self.lookup_subtree(path) {
            SubtreeLookupStatus::Found(MixedHashTree::Leaf(value)) => LookupStatus::Found(value),
            SubtreeLookupStatus::Found(MixedHashTree::Pruned(_)) => LookupStatus::Unknown,
            SubtreeLookupStatus::Found(MixedHashTree::Empty) => LookupStatus::Absent,
            SubtreeLookupStatus::Found(_) => LookupStatus::Error(LookupError::NotALeaf),
            SubtreeLookupStatus::Absent => LookupStatus::Absent,
            SubtreeLookupStatus::Unknown => LookupStatus::Unknown,
            SubtreeLookupStatus::Error(e) => LookupStatus::Error(e),
        }
    }

    /// Looks up the subtree rooted at `path`.
    pub fn lookup_subtree<'a>(&'a self, path: &Path) -> SubtreeLookupStatus<'a> {
        let mut current = self;
        for label in path.segments() {
            match current {
                Self::Leaf(_) => return SubtreeLookupStatus::Error(LookupError::UnexpectedLeaf),
                _ => match find_label(current, label) {
                    SearchResult::Found(subtree) => current = subtree,
                    SearchResult::Absent => return SubtreeLookupStatus::Absent,
                    SearchResult::Unknown => return SubtreeLookupStatus::Unknown,
                    SearchResult::Error(e) => return SubtreeLookupStatus::Error(e),
                },
            }
        }
        SubtreeLookupStatus::Found(current)
    }

    /// The labelled children of this node, in label order, forks flattened.
    pub fn flatten_forks(&self) -> Vec<(&Label, &MixedHashTree)> {
        let mut nodes = Vec::new();
        flatten_into(self, &mut nodes);
        nodes
            .into_iter()
            .filter_map(|node| match node {
                Self::Labeled(label, subtree) => Some((label, subtree.as_ref())),
                _ => None,
            })
            .collect()
    }
}

fn flatten_into<'a>(tree: &'a MixedHashTree, out: &mut Vec<&'a MixedHashTree>) {
    match tree {
        MixedHashTree::Fork(fork) => {
            flatten_into(&fork.0, out);
            flatten_into(&fork.1, out);
        }
        other => out.push(other),
    }
}

/// Searches the flattened fork sequence of `tree` for `label`.
///
/// Labels in an honest tree appear in strictly increasing order, so absence
/// is provable exactly when no pruned node sits in the gap where `label`
/// would have to live.
fn find_label<'a>(tree: &'a MixedHashTree, label: &Label) -> SearchResult<'a> {
    let mut nodes = Vec::new();
    flatten_into(tree, &mut nodes);

    // The half-open index range of flattened nodes where `label` could hide.
    let mut gap_start = 0;
    let mut gap_end = nodes.len();
    for (i, node) in nodes.iter().enumerate() {
        if let MixedHashTree::Labeled(l, subtree) = node {
            match l.cmp(label) {
                Ordering::Equal => return SearchResult::Found(subtree),
                Ordering::Less => gap_start = i + 1,
                Ordering::Greater => {
                    gap_end = i;
                    break;
                }
            }
        }
    }

    let pruned_in_gap = nodes[gap_start..gap_end]
        .iter()
        .any(|node| matches!(node, MixedHashTree::Pruned(_)));
    if pruned_in_gap {
        SearchResult::Unknown
    } else {
        SearchResult::Absent
    }
}

fn domain_hasher(domain: &str) -> Sha256 {
    debug_assert!(domain.len() < 256);
    let mut hasher = Sha256::new();
    hasher.update([domain.len() as u8]);
    hasher.update(domain.as_bytes());
    hasher
}

fn domain_hash(domain: &str, payload: &[u8]) -> Digest {
    let mut hasher = domain_hasher(domain);
    hasher.update(payload);
    finish(hasher)
}

fn finish(hasher: Sha256) -> Digest {
    Digest(hasher.finalize().into())
}

#[cfg(test)]
mod tests;
