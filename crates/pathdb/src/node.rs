use alloy_primitives::{keccak256, B256, Bytes};

/// A modified trie node, tagged with the hash of its content.
///
/// An empty blob is the deletion marker: it records that the node existed in
/// the parent state and must be removed from disk when the enclosing set is
/// flushed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrieNode {
    /// Hash of the node content, zero for deleted nodes.
    pub hash: B256,
    /// Encoded node content, empty for deleted nodes.
    pub blob: Bytes,
    /// Whether the node is a leaf of its trie.
    pub is_leaf: bool,
}

impl TrieNode {
    /// Creates a node from its parts.
    pub fn new(hash: B256, blob: Bytes, is_leaf: bool) -> Self {
        Self { hash, blob, is_leaf }
    }

    /// Creates an internal node, hashing the blob.
    pub fn from_blob(blob: Bytes) -> Self {
        Self { hash: keccak256(&blob), blob, is_leaf: false }
    }

    /// Creates a leaf node, hashing the blob.
    pub fn leaf(blob: Bytes) -> Self {
        Self { hash: keccak256(&blob), blob, is_leaf: true }
    }

    /// Creates a deletion marker.
    pub fn deleted() -> Self {
        Self { hash: B256::ZERO, blob: Bytes::new(), is_leaf: false }
    }

    /// Returns whether this node marks a deletion.
    pub fn is_deleted(&self) -> bool {
        self.blob.is_empty()
    }

    /// Returns the size of the node content in bytes.
    pub fn size(&self) -> usize {
        self.blob.len()
    }
}
