use crate::{cache::CleanCache, node::TrieNode, schema, PathdbError};
use alloy_primitives::{
    map::{B256Map, HashMap},
    B256,
};
use lamina_storage_api::{KeyValueReader, WriteBatch};
use nybbles::Nibbles;

/// Trie nodes grouped by owning trie: `owner → path → node`.
///
/// A zero owner denotes the account trie, any other value the storage trie
/// of that account.
pub type NodeMap = B256Map<HashMap<Nibbles, TrieNode>>;

/// A collection of modified trie nodes with approximate size accounting.
///
/// The tracked size is the sum of `path length + blob length` over all
/// entries, which is what the buffer threshold compares against.
#[derive(Clone, Debug, Default)]
pub struct NodeSet {
    nodes: NodeMap,
    size: u64,
}

impl NodeSet {
    /// Creates a set from pre-grouped nodes.
    pub fn new(nodes: NodeMap) -> Self {
        let mut set = Self { nodes, size: 0 };
        let mut size = 0u64;
        for (_, subset) in set.nodes.iter() {
            for (path, node) in subset.iter() {
                size += entry_size(path, node);
            }
        }
        set.size = size;
        set
    }

    /// Returns the node stored under `(owner, path)`, if any.
    pub fn node(&self, owner: &B256, path: &Nibbles) -> Option<&TrieNode> {
        self.nodes.get(owner)?.get(path)
    }

    /// Returns the grouped nodes.
    pub fn as_map(&self) -> &NodeMap {
        &self.nodes
    }

    /// Returns the approximate content size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the number of nodes across all tries.
    pub fn len(&self) -> usize {
        self.nodes.values().map(HashMap::len).sum()
    }

    /// Returns whether the set holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.values().all(HashMap::is_empty)
    }

    /// Merges `other` on top of this set; entries in `other` are newer and
    /// win. Deletion markers are ordinary entries and survive the merge.
    pub fn merge(&mut self, other: &Self) {
        let mut delta = 0i64;
        for (owner, subset) in other.nodes.iter() {
            let current = self.nodes.entry(*owner).or_default();
            for (path, node) in subset.iter() {
                if let Some(replaced) = current.insert(path.clone(), node.clone()) {
                    delta += node.size() as i64 - replaced.size() as i64;
                } else {
                    delta += entry_size(path, node) as i64;
                }
            }
        }
        self.update_size(delta);
    }

    /// Overwrites entries with the pre-images of the most recent transition.
    ///
    /// Keys absent from this set never made it into the buffer; for those the
    /// persisted value must already equal the pre-image, anything else means
    /// the reverse patch does not belong to the buffered transition.
    pub fn revert_to(
        &mut self,
        db: &dyn KeyValueReader,
        reverse: &NodeMap,
    ) -> Result<(), PathdbError> {
        let mut delta = 0i64;
        for (owner, subset) in reverse.iter() {
            let current = self.nodes.entry(*owner).or_default();
            for (path, node) in subset.iter() {
                match current.get_mut(path) {
                    Some(existing) => {
                        delta += node.size() as i64 - existing.size() as i64;
                        *existing = node.clone();
                    }
                    None => {
                        let stored = schema::read_trie_node(db, owner, path)?.unwrap_or_default();
                        if stored.as_slice() != node.blob.as_ref() {
                            panic!(
                                "reverse patch mismatch (owner {owner}, path {path:?}): \
                                 disk holds {} bytes, pre-image {} bytes",
                                stored.len(),
                                node.blob.len()
                            );
                        }
                    }
                }
            }
        }
        self.update_size(delta);
        Ok(())
    }

    /// Queues every node into `batch` and mirrors the outcome into the clean
    /// cache. Returns the number of written nodes.
    pub(crate) fn write(&self, batch: &mut WriteBatch, clean: Option<&CleanCache>) -> usize {
        let mut written = 0;
        for (owner, subset) in self.nodes.iter() {
            for (path, node) in subset.iter() {
                let key = schema::trie_node_key(owner, path);
                if node.is_deleted() {
                    if let Some(cache) = clean {
                        cache.remove(&crate::cache::node_cache_key(owner, path));
                    }
                    batch.delete(key);
                } else {
                    if let Some(cache) = clean {
                        cache.insert(&crate::cache::node_cache_key(owner, path), &node.blob);
                    }
                    batch.put(key, node.blob.to_vec());
                }
                written += 1;
            }
        }
        written
    }

    /// Returns the estimated database footprint of a flush, i.e. content
    /// plus per-entry key prefixes.
    pub fn db_size(&self) -> usize {
        let entries = self.len();
        self.size as usize + entries * (schema::STORAGE_TRIE_NODE_PREFIX.len() + B256::len_bytes())
    }

    /// Clears the set.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.size = 0;
    }

    fn update_size(&mut self, delta: i64) {
        self.size = self.size.saturating_add_signed(delta);
    }
}

fn entry_size(path: &Nibbles, node: &TrieNode) -> u64 {
    (path.len() + node.size()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{b256, Bytes};

    fn account_nodes(entries: &[(&[u8], &[u8])]) -> NodeMap {
        let mut subset: HashMap<Nibbles, TrieNode> = HashMap::default();
        for (path, blob) in entries {
            let node = if blob.is_empty() {
                TrieNode::deleted()
            } else {
                TrieNode::from_blob(Bytes::copy_from_slice(blob))
            };
            subset.insert(Nibbles::from_nibbles_unchecked(path.to_vec()), node);
        }
        let mut map = NodeMap::default();
        map.insert(B256::ZERO, subset);
        map
    }

    #[test]
    fn size_tracks_entries() {
        let set = NodeSet::new(account_nodes(&[(&[0x1, 0x2], b"abcd"), (&[0x3], b"xy")]));
        // (2 + 4) + (1 + 2)
        assert_eq!(set.size(), 9);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn merge_prefers_newer_and_keeps_deletions() {
        let mut base = NodeSet::new(account_nodes(&[(&[0x1], b"old-value")]));
        let newer = NodeSet::new(account_nodes(&[(&[0x1], b""), (&[0x2], b"fresh")]));
        base.merge(&newer);

        let path = Nibbles::from_nibbles_unchecked(vec![0x1]);
        assert!(base.node(&B256::ZERO, &path).unwrap().is_deleted());
        // 1 (deleted entry path) + 1 + 5
        assert_eq!(base.size(), 7);
    }

    #[test]
    fn revert_restores_previous_blobs() {
        let db = lamina_storage_api::MemoryStore::new();
        let mut set = NodeSet::new(account_nodes(&[(&[0x1], b"post")]));
        let reverse = account_nodes(&[(&[0x1], b"pre-image")]);

        set.revert_to(&db, &reverse).unwrap();
        let path = Nibbles::from_nibbles_unchecked(vec![0x1]);
        assert_eq!(set.node(&B256::ZERO, &path).unwrap().blob.as_ref(), b"pre-image");
        assert_eq!(set.size(), 10);
    }

    #[test]
    #[should_panic(expected = "reverse patch mismatch")]
    fn revert_rejects_foreign_patch() {
        let db = lamina_storage_api::MemoryStore::new();
        let mut set = NodeSet::new(NodeMap::default());
        let reverse = account_nodes(&[(&[0x7], b"never-buffered")]);
        let _ = set.revert_to(&db, &reverse);
    }

    #[test]
    fn write_emits_puts_and_deletes() {
        use lamina_storage_api::BatchOp;

        let owner = b256!("00000000000000000000000000000000000000000000000000000000000000cc");
        let mut map = account_nodes(&[(&[0x1], b"value")]);
        let mut storage: HashMap<Nibbles, TrieNode> = HashMap::default();
        storage.insert(Nibbles::from_nibbles_unchecked(vec![0x2]), TrieNode::deleted());
        map.insert(owner, storage);

        let set = NodeSet::new(map);
        let mut batch = WriteBatch::new();
        assert_eq!(set.write(&mut batch, None), 2);

        let ops = batch.into_ops();
        assert!(ops.contains(&BatchOp::Put(b"A\x01".to_vec(), b"value".to_vec())));
        let storage_key = schema::storage_trie_node_key(
            &owner,
            &Nibbles::from_nibbles_unchecked(vec![0x2]),
        );
        assert!(ops.contains(&BatchOp::Delete(storage_key)));
    }
}
