use crate::{
    AncientStore, BatchOp, KeyValueReader, KeyValueStore, StorageError, StorageResult, WriteBatch,
};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

/// An in-memory [`KeyValueStore`].
///
/// Batches are applied under a single write lock, so readers observe either
/// none or all of a batch.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueReader for MemoryStore {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }
}

impl KeyValueStore for MemoryStore {
    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut entries = self.entries.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => {
                    entries.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct AncientInner {
    /// Items retained in the log; `items[0]` carries id `tail`.
    items: VecDeque<Vec<u8>>,
    /// Id of the first retained item.
    tail: u64,
}

/// An in-memory [`AncientStore`].
#[derive(Debug, Default)]
pub struct MemoryAncientStore {
    inner: RwLock<AncientInner>,
}

impl MemoryAncientStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AncientStore for MemoryAncientStore {
    fn append(&self, id: u64, blob: &[u8]) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let head = inner.tail + inner.items.len() as u64;
        if id != head {
            return Err(StorageError::OutOfOrderAppend { have: id, want: head });
        }
        inner.items.push_back(blob.to_vec());
        Ok(())
    }

    fn read(&self, id: u64) -> StorageResult<Vec<u8>> {
        let inner = self.inner.read();
        let head = inner.tail + inner.items.len() as u64;
        if id < inner.tail || id >= head {
            return Err(StorageError::OutOfBounds { id, tail: inner.tail, head });
        }
        Ok(inner.items[(id - inner.tail) as usize].clone())
    }

    fn head(&self) -> StorageResult<u64> {
        let inner = self.inner.read();
        Ok(inner.tail + inner.items.len() as u64)
    }

    fn tail(&self) -> StorageResult<u64> {
        Ok(self.inner.read().tail)
    }

    fn truncate_head(&self, items: u64) -> StorageResult<u64> {
        let mut inner = self.inner.write();
        let head = inner.tail + inner.items.len() as u64;
        if items >= head {
            return Ok(0);
        }
        let keep = items.saturating_sub(inner.tail);
        let removed = inner.items.len() as u64 - keep;
        inner.items.truncate(keep as usize);
        Ok(removed)
    }

    fn truncate_tail(&self, items: u64) -> StorageResult<u64> {
        let mut inner = self.inner.write();
        let head = inner.tail + inner.items.len() as u64;
        if items <= inner.tail {
            return Ok(0);
        }
        let removed = items.min(head) - inner.tail;
        inner.items.drain(..removed as usize);
        inner.tail += removed;
        Ok(removed)
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}
