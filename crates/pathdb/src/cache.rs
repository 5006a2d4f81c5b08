use crate::node::TrieNode;
use alloy_primitives::{map::HashMap, B256};
use nybbles::Nibbles;
use parking_lot::Mutex;
use schnellru::{ByLength, ByMemoryUsage, LruMap};
use std::sync::Arc;

/// Identity of a trie node: owning trie and path within it.
pub(crate) type NodeKey = (B256, Nibbles);

/// A single-probe `(owner, path) → node` index over one diff layer.
pub(crate) type FlatIndex = HashMap<NodeKey, TrieNode>;

/// Returns the clean-cache key of a trie node: the bare path for
/// account-trie nodes, `owner + path` for storage-trie nodes.
pub(crate) fn node_cache_key(owner: &B256, path: &Nibbles) -> Vec<u8> {
    if owner.is_zero() {
        path.to_vec()
    } else {
        let mut key = Vec::with_capacity(B256::len_bytes() + path.len());
        key.extend_from_slice(owner.as_slice());
        key.extend_from_slice(path.as_slice());
        key
    }
}

/// A memory-bounded cache of clean trie nodes read from disk.
///
/// Shared across successor disk layers; only the single non-stale disk layer
/// mutates it, everyone else reads.
pub(crate) struct CleanCache {
    inner: Mutex<LruMap<Vec<u8>, Vec<u8>, ByMemoryUsage>>,
}

impl CleanCache {
    pub(crate) fn new(budget: usize) -> Self {
        Self { inner: Mutex::new(LruMap::with_memory_budget(budget)) }
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.lock().get(&key.to_vec()).map(|blob| blob.clone())
    }

    pub(crate) fn insert(&self, key: &[u8], blob: &[u8]) {
        self.inner.lock().insert(key.to_vec(), blob.to_vec());
    }

    pub(crate) fn remove(&self, key: &[u8]) {
        self.inner.lock().remove(&key.to_vec());
    }

    /// Drops every cached node, releasing the memory to the allocator.
    pub(crate) fn reset(&self) {
        self.inner.lock().clear();
    }
}

impl core::fmt::Debug for CleanCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CleanCache").finish_non_exhaustive()
    }
}

/// An LRU of per-diff-layer flat lookup indexes, keyed by layer root.
///
/// Diff layers keep their node sets in two-level owner/path maps; the first
/// lookup against a layer flattens them into a single-probe index which lives
/// here until the layer is flattened into disk or evicted.
pub(crate) struct LookupCache {
    inner: Mutex<LruMap<B256, Arc<FlatIndex>, ByLength>>,
}

impl LookupCache {
    pub(crate) fn new(layers: u32) -> Self {
        Self { inner: Mutex::new(LruMap::new(ByLength::new(layers))) }
    }

    /// Returns the cached index for `root`, building it via `build` on miss.
    pub(crate) fn get_or_build(
        &self,
        root: B256,
        build: impl FnOnce() -> FlatIndex,
    ) -> Arc<FlatIndex> {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.get(&root) {
            return index.clone();
        }
        let index = Arc::new(build());
        inner.insert(root, index.clone());
        index
    }

    /// Drops the index of a flattened or removed layer.
    pub(crate) fn remove(&self, root: &B256) {
        self.inner.lock().remove(root);
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, root: &B256) -> bool {
        self.inner.lock().peek(root).is_some()
    }
}

impl core::fmt::Debug for LookupCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LookupCache").finish_non_exhaustive()
    }
}

/// Looks up a node in a flat index.
pub(crate) fn flat_get<'a>(
    index: &'a FlatIndex,
    owner: &B256,
    path: &Nibbles,
) -> Option<&'a TrieNode> {
    index.get(&(*owner, path.clone()))
}
