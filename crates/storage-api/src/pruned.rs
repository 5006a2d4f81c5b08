use crate::{AncientStore, KeyValueStore, StorageError, StorageResult};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::info;

/// Key under which the pruned ancient store persists its frozen watermark.
pub const FROZEN_WATERMARK_KEY: &[u8] = b"AncientFrozenWatermark";

/// An [`AncientStore`] that retains no payloads.
///
/// Only the frozen-head watermark survives, persisted into the meta
/// key-value store on `sync`. Appends and head truncation move the
/// watermark; reads and tail truncation fail with
/// [`StorageError::NotSupported`], which makes the tradeoff explicit:
/// a node running this variant cannot roll its state back across the
/// pruned range.
#[derive(Debug)]
pub struct PrunedAncientStore<S> {
    meta: Arc<S>,
    frozen: AtomicU64,
}

impl<S: KeyValueStore> PrunedAncientStore<S> {
    /// Opens the store, repairing the watermark from the meta database.
    ///
    /// The effective watermark is the maximum of `offset` (supplied by the
    /// pruning tool that produced this database) and the persisted value.
    pub fn new(meta: Arc<S>, offset: u64) -> StorageResult<Self> {
        let stored = read_watermark(meta.as_ref())?;
        let frozen = offset.max(stored);
        info!(target: "storage", frozen, "Opened ancient store in nodata mode");
        let store = Self { meta, frozen: AtomicU64::new(frozen) };
        store.sync()?;
        Ok(store)
    }

    /// Returns the current frozen watermark.
    pub fn frozen(&self) -> u64 {
        self.frozen.load(Ordering::Acquire)
    }
}

fn read_watermark<S: KeyValueStore>(meta: &S) -> StorageResult<u64> {
    Ok(match meta.get(FROZEN_WATERMARK_KEY)? {
        Some(raw) => {
            let bytes: [u8; 8] = raw
                .as_slice()
                .try_into()
                .map_err(|_| StorageError::Backend("malformed frozen watermark".to_string()))?;
            u64::from_be_bytes(bytes)
        }
        None => 0,
    })
}

impl<S: KeyValueStore> AncientStore for PrunedAncientStore<S> {
    fn append(&self, id: u64, _blob: &[u8]) -> StorageResult<()> {
        let head = self.frozen.load(Ordering::Acquire);
        if id != head {
            return Err(StorageError::OutOfOrderAppend { have: id, want: head });
        }
        // The payload is discarded; only the watermark advances.
        self.frozen.store(head + 1, Ordering::Release);
        Ok(())
    }

    fn read(&self, _id: u64) -> StorageResult<Vec<u8>> {
        Err(StorageError::NotSupported("pruned ancient store retains no payloads"))
    }

    fn head(&self) -> StorageResult<u64> {
        Ok(self.frozen())
    }

    fn tail(&self) -> StorageResult<u64> {
        // Nothing is retained, so the tail trails the head exactly.
        Ok(self.frozen())
    }

    fn truncate_head(&self, items: u64) -> StorageResult<u64> {
        let head = self.frozen.load(Ordering::Acquire);
        if items >= head {
            return Ok(0);
        }
        self.frozen.store(items, Ordering::Release);
        Ok(head - items)
    }

    fn truncate_tail(&self, _items: u64) -> StorageResult<u64> {
        Err(StorageError::NotSupported("pruned ancient store has no tail data"))
    }

    fn sync(&self) -> StorageResult<()> {
        self.meta.put(FROZEN_WATERMARK_KEY, &self.frozen().to_be_bytes())
    }
}
