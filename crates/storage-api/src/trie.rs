use crate::StorageResult;
use alloy_primitives::{Address, Bytes, B256};

/// Read access to a single merkle trie.
///
/// Implementations are expected to cache resolved nodes internally; the
/// prefetcher exploits exactly that side effect. Lookups take `&mut self`
/// because resolving a key materializes nodes into the trie.
pub trait Trie: Send {
    /// Resolves the account stored under `address`, or `None` if absent.
    fn get_account(&mut self, address: Address) -> StorageResult<Option<Bytes>>;

    /// Resolves the storage slot `key` of `address`, or `None` if absent.
    fn get_storage(&mut self, address: Address, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Returns a deep copy carrying all nodes resolved so far.
    fn copied(&self) -> Box<dyn Trie>;
}

/// Opens tries at a given state root.
#[auto_impl::auto_impl(&, Arc)]
pub trait TrieOpener: Send + Sync + core::fmt::Debug {
    /// Opens the account trie of the state rooted at `state_root`.
    fn open_trie(&self, state_root: B256) -> StorageResult<Box<dyn Trie>>;

    /// Opens the storage trie of `address` with root `root`, in the state
    /// rooted at `state_root`.
    fn open_storage_trie(
        &self,
        state_root: B256,
        address: Address,
        root: B256,
    ) -> StorageResult<Box<dyn Trie>>;
}
