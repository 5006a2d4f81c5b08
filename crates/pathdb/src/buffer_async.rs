use crate::{
    buffer::Buffer,
    cache::CleanCache,
    node::TrieNode,
    nodes::{NodeMap, NodeSet},
    states::StateSet,
    PathdbError,
};
use alloy_primitives::{map::B256Map, Bytes, B256};
use lamina_storage_api::{AncientStore, KeyValueReader, KeyValueStore, StorageError};
use nybbles::Nibbles;
use parking_lot::{Mutex, RwLock};
use std::{
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};
use tracing::error;

/// A write-back buffer that flushes on a background thread.
///
/// Commits land in the front buffer while a previously swapped-out back
/// buffer is being written; reads consult both. A new flush joins the
/// in-flight one first, so at most one batch is outstanding and the batch is
/// durable before the next swap.
#[derive(Clone, Debug)]
pub(crate) struct AsyncBuffer {
    inner: Arc<AsyncInner>,
}

#[derive(Debug)]
struct AsyncInner {
    front: RwLock<Buffer>,
    back: RwLock<Buffer>,
    flushing: AtomicBool,
    stopped: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncBuffer {
    pub(crate) fn new(limit: u64) -> Self {
        Self {
            inner: Arc::new(AsyncInner {
                front: RwLock::new(Buffer::empty(limit)),
                back: RwLock::new(Buffer::empty(limit)),
                flushing: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                handle: Mutex::new(None),
            }),
        }
    }

    fn node(&self, owner: &B256, path: &Nibbles) -> Option<TrieNode> {
        if let Some(node) = self.inner.front.read().node(owner, path) {
            return Some(node.clone());
        }
        self.inner.back.read().node(owner, path).cloned()
    }

    fn account(&self, hash: &B256) -> Option<Bytes> {
        if let Some(blob) = self.inner.front.read().account(hash) {
            return Some(blob.clone());
        }
        self.inner.back.read().account(hash).cloned()
    }

    fn storage(&self, account_hash: &B256, slot_hash: &B256) -> Option<Bytes> {
        if let Some(blob) = self.inner.front.read().storage(account_hash, slot_hash) {
            return Some(blob.clone());
        }
        self.inner.back.read().storage(account_hash, slot_hash).cloned()
    }

    fn commit(&self, nodes: &NodeSet, states: &StateSet) {
        self.inner.front.write().commit(nodes, states);
    }

    fn revert_to(
        &self,
        db: &dyn KeyValueReader,
        nodes: &NodeMap,
        accounts: &B256Map<Bytes>,
        storages: &B256Map<B256Map<Bytes>>,
    ) -> Result<(), PathdbError> {
        // The reverse patch targets the union of both buffers; reconcile
        // them before unwinding.
        self.join_inflight();
        let mut front = self.inner.front.write();
        let mut back = self.inner.back.write();
        if !back.is_empty() {
            let limit = back.limit();
            front.absorb_older(mem::replace(&mut *back, Buffer::empty(limit)));
        }
        front.revert_to(db, nodes, accounts, storages)
    }

    fn flush(
        &self,
        db: Arc<dyn KeyValueStore>,
        freezer: Option<Arc<dyn AncientStore>>,
        clean: Option<Arc<CleanCache>>,
        id: u64,
        force: bool,
    ) -> Result<(), PathdbError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        if !force && !self.inner.front.read().is_full() {
            return Ok(());
        }
        // The previous batch must be durable before the buffers swap again.
        self.join_inflight();
        {
            let mut front = self.inner.front.write();
            let mut back = self.inner.back.write();
            if !back.is_empty() {
                // The previous background flush failed; fold its content
                // back under the front buffer and retry it as one batch.
                let limit = back.limit();
                front.absorb_older(mem::replace(&mut *back, Buffer::empty(limit)));
            }
            mem::swap(&mut *front, &mut *back);
        }
        self.inner.flushing.store(true, Ordering::Release);
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("lamina-buffer-flush".into())
            .spawn(move || {
                let result =
                    inner.back.read().write_out(&db, freezer.as_deref(), clean.as_deref(), id);
                match result {
                    Ok(()) => inner.back.write().reset(),
                    Err(err) => {
                        error!(target: "pathdb", %err, "Background buffer flush failed")
                    }
                }
                inner.flushing.store(false, Ordering::Release);
            })
            .map_err(|err| PathdbError::Storage(StorageError::Backend(err.to_string())))?;
        *self.inner.handle.lock() = Some(handle);
        Ok(())
    }

    fn join_inflight(&self) {
        if let Some(handle) = self.inner.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn wait_and_stop_flushing(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.join_inflight();
    }

    fn is_empty(&self) -> bool {
        self.inner.front.read().is_empty() && self.inner.back.read().is_empty()
    }

    fn size(&self) -> u64 {
        self.inner.front.read().size() + self.inner.back.read().size()
    }
}

/// Dispatch between the synchronous and the background-flushing buffer.
#[derive(Debug)]
pub(crate) enum NodeBuffer {
    /// Flushes inline on the committing thread.
    Sync(RwLock<Buffer>),
    /// Flushes on a dedicated background thread.
    Async(AsyncBuffer),
}

impl NodeBuffer {
    pub(crate) fn new(sync_flush: bool, limit: u64) -> Self {
        if sync_flush {
            Self::Sync(RwLock::new(Buffer::empty(limit)))
        } else {
            Self::Async(AsyncBuffer::new(limit))
        }
    }

    pub(crate) fn node(&self, owner: &B256, path: &Nibbles) -> Option<TrieNode> {
        match self {
            Self::Sync(buffer) => buffer.read().node(owner, path).cloned(),
            Self::Async(buffer) => buffer.node(owner, path),
        }
    }

    pub(crate) fn account(&self, hash: &B256) -> Option<Bytes> {
        match self {
            Self::Sync(buffer) => buffer.read().account(hash).cloned(),
            Self::Async(buffer) => buffer.account(hash),
        }
    }

    pub(crate) fn storage(&self, account_hash: &B256, slot_hash: &B256) -> Option<Bytes> {
        match self {
            Self::Sync(buffer) => buffer.read().storage(account_hash, slot_hash).cloned(),
            Self::Async(buffer) => buffer.storage(account_hash, slot_hash),
        }
    }

    pub(crate) fn commit(&self, nodes: &NodeSet, states: &StateSet) {
        match self {
            Self::Sync(buffer) => buffer.write().commit(nodes, states),
            Self::Async(buffer) => buffer.commit(nodes, states),
        }
    }

    pub(crate) fn revert_to(
        &self,
        db: &dyn KeyValueReader,
        nodes: &NodeMap,
        accounts: &B256Map<Bytes>,
        storages: &B256Map<B256Map<Bytes>>,
    ) -> Result<(), PathdbError> {
        match self {
            Self::Sync(buffer) => buffer.write().revert_to(db, nodes, accounts, storages),
            Self::Async(buffer) => buffer.revert_to(db, nodes, accounts, storages),
        }
    }

    pub(crate) fn flush(
        &self,
        db: Arc<dyn KeyValueStore>,
        freezer: Option<Arc<dyn AncientStore>>,
        clean: Option<Arc<CleanCache>>,
        id: u64,
        force: bool,
    ) -> Result<(), PathdbError> {
        match self {
            Self::Sync(buffer) => {
                buffer.write().flush(&db, freezer.as_deref(), clean.as_deref(), id, force)
            }
            Self::Async(buffer) => buffer.flush(db, freezer, clean, id, force),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Self::Sync(buffer) => buffer.read().is_empty(),
            Self::Async(buffer) => buffer.is_empty(),
        }
    }

    pub(crate) fn size(&self) -> u64 {
        match self {
            Self::Sync(buffer) => buffer.read().size(),
            Self::Async(buffer) => buffer.size(),
        }
    }

    /// Blocks until any outstanding background batch is durable and stops
    /// further background flushes. A no-op for the synchronous variant.
    pub(crate) fn wait_and_stop_flushing(&self) {
        if let Self::Async(buffer) = self {
            buffer.wait_and_stop_flushing();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use alloy_primitives::map::HashMap;
    use lamina_storage_api::MemoryStore;

    fn node_set(path: &[u8], blob: &[u8]) -> NodeSet {
        let mut subset: HashMap<Nibbles, TrieNode> = HashMap::default();
        subset.insert(
            Nibbles::from_nibbles_unchecked(path.to_vec()),
            TrieNode::from_blob(Bytes::copy_from_slice(blob)),
        );
        let mut map = NodeMap::default();
        map.insert(B256::ZERO, subset);
        NodeSet::new(map)
    }

    #[test]
    fn async_flush_drains_through_stop() {
        let db: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let buffer = NodeBuffer::new(false, 1 << 20);

        buffer.commit(&node_set(&[0x1], b"one"), &StateSet::default());
        buffer.flush(db.clone(), None, None, 1, true).unwrap();
        buffer.wait_and_stop_flushing();

        assert!(buffer.is_empty());
        assert_eq!(schema::read_persistent_state_id(&db).unwrap(), 1);
        assert_eq!(db.get(b"A\x01").unwrap(), Some(b"one".to_vec()));
    }

    #[test]
    fn async_reads_cover_the_inflight_buffer() {
        let db: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let buffer = NodeBuffer::new(false, 1 << 20);
        let path = Nibbles::from_nibbles_unchecked(vec![0x1]);

        buffer.commit(&node_set(&[0x1], b"one"), &StateSet::default());
        buffer.flush(db, None, None, 1, true).unwrap();

        // Whether the background batch has landed or not, the lookup must
        // succeed: either from the back buffer or not at all once reset.
        if let Some(node) = buffer.node(&B256::ZERO, &path) {
            assert_eq!(node.blob.as_ref(), b"one");
        }
        buffer.wait_and_stop_flushing();
        assert!(buffer.node(&B256::ZERO, &path).is_none());
    }

    #[test]
    fn stopped_buffer_skips_new_flushes() {
        let db: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let buffer = NodeBuffer::new(false, 16);

        buffer.wait_and_stop_flushing();
        buffer.commit(&node_set(&[0x1], b"over-the-limit-content"), &StateSet::default());
        buffer.flush(db.clone(), None, None, 1, true).unwrap();

        assert!(!buffer.is_empty(), "flush after stop must be a no-op");
        assert_eq!(schema::read_persistent_state_id(&db).unwrap(), 0);
    }
}
