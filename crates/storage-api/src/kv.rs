use crate::StorageResult;

/// Read access to a key-value store.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait KeyValueReader: Send + Sync + core::fmt::Debug {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Returns whether `key` is present.
    fn has(&self, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Write access to a key-value store.
///
/// Individual `put`/`delete` calls carry no atomicity guarantee across keys;
/// multi-key mutations must go through [`WriteBatch`] which is applied
/// atomically by `write_batch`.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait KeyValueStore: KeyValueReader {
    /// Stores `value` under `key`.
    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Removes `key` if present.
    fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Applies all operations in `batch` atomically.
    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()>;
}

/// A single operation inside a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    /// Store a value under a key.
    Put(Vec<u8>, Vec<u8>),
    /// Remove a key.
    Delete(Vec<u8>),
}

/// An ordered set of mutations applied atomically by a [`KeyValueStore`].
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    value_size: usize,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty batch pre-sized for roughly `size` bytes of payload.
    pub fn with_size_hint(size: usize) -> Self {
        // Assume small values; the estimate only spares reallocations.
        Self { ops: Vec::with_capacity(size / 64 + 1), value_size: 0 }
    }

    /// Queues a put operation.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.value_size += key.len() + value.len();
        self.ops.push(BatchOp::Put(key, value));
    }

    /// Queues a delete operation.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.value_size += key.len();
        self.ops.push(BatchOp::Delete(key));
    }

    /// Returns the accumulated payload size in bytes.
    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /// Returns the number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns whether the batch holds no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the batch, yielding its operations in insertion order.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}
