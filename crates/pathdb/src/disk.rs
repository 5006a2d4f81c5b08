use crate::{
    buffer_async::NodeBuffer,
    cache::{node_cache_key, CleanCache, LookupCache},
    db::{Config, StateRewinder},
    diff::DiffLayer,
    history::{self, History},
    layer::{NodeLoc, NodeLocation},
    metrics::DiskLayerMetrics,
    nodes::NodeSet,
    schema, PathdbError,
};
use alloy_primitives::{keccak256, Bytes, B256};
use lamina_storage_api::{AncientStore, KeyValueStore, StorageError, WriteBatch};
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::debug;

/// The persistent bottom of the layer stack.
///
/// Reads consult the write-back buffer, then the clean node cache, then the
/// key-value store. The buffer needs no read locking of its own here because
/// it is only mutated after this layer has been tagged stale, and every read
/// checks the stale flag first under the layer lock.
///
/// Exactly one disk layer is live at any time. Committing a diff layer onto
/// it produces a fresh instance that inherits the clean cache and the
/// buffer; the predecessor is tagged stale and every later read against it
/// fails with [`PathdbError::SnapshotStale`].
#[derive(Debug)]
pub struct DiskLayer {
    root: B256,
    id: u64,
    db: Arc<dyn KeyValueStore>,
    freezer: Option<Arc<dyn AncientStore>>,
    clean: Option<Arc<CleanCache>>,
    buffer: Arc<NodeBuffer>,
    lookup: Arc<LookupCache>,
    config: Arc<Config>,
    stale: AtomicBool,
    lock: RwLock<()>,
    metrics: DiskLayerMetrics,
}

impl DiskLayer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        root: B256,
        id: u64,
        db: Arc<dyn KeyValueStore>,
        freezer: Option<Arc<dyn AncientStore>>,
        clean: Option<Arc<CleanCache>>,
        buffer: Arc<NodeBuffer>,
        lookup: Arc<LookupCache>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            root,
            id,
            db,
            freezer,
            clean,
            buffer,
            lookup,
            config,
            stale: AtomicBool::new(false),
            lock: RwLock::new(()),
            metrics: DiskLayerMetrics::default(),
        }
    }

    /// Returns the root hash of the persisted state.
    pub fn root(&self) -> B256 {
        self.root
    }

    /// Returns the state id of the persisted state.
    pub fn state_id(&self) -> u64 {
        self.id
    }

    /// Returns whether this layer was flattened across and abandoned.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Tags the layer stale. Panics if it already is: that means two
    /// children tried to commit onto the same base.
    fn mark_stale(&self) {
        if self.stale.swap(true, Ordering::AcqRel) {
            panic!("disk layer is stale");
        }
    }

    /// Retrieves a trie node. The returned hash is computed from the blob
    /// for cache and disk hits, so callers can verify expectations.
    pub fn node(
        &self,
        owner: B256,
        path: &nybbles::Nibbles,
        depth: usize,
    ) -> Result<(Bytes, B256, NodeLoc), PathdbError> {
        let _guard = self.lock.read();
        if self.is_stale() {
            return Err(PathdbError::SnapshotStale);
        }

        // Dirty buffer first: it holds not-yet-written data that shadows
        // everything below.
        if let Some(node) = self.buffer.node(&owner, path) {
            self.metrics.dirty_node_hit.increment(1);
            self.metrics.dirty_node_read_bytes.increment(node.size() as u64);
            self.metrics.dirty_node_hit_depth.record(depth as f64);
            return Ok((
                node.blob.clone(),
                node.hash,
                NodeLoc { location: NodeLocation::DirtyBuffer, depth },
            ));
        }
        self.metrics.dirty_node_miss.increment(1);

        let cache_key = node_cache_key(&owner, path);
        if let Some(clean) = &self.clean {
            if let Some(blob) = clean.get(&cache_key) {
                self.metrics.clean_node_hit.increment(1);
                self.metrics.clean_node_read_bytes.increment(blob.len() as u64);
                let hash = keccak256(&blob);
                return Ok((
                    Bytes::from(blob),
                    hash,
                    NodeLoc { location: NodeLocation::CleanCache, depth },
                ));
            }
            self.metrics.clean_node_miss.increment(1);
        }

        let blob = schema::read_trie_node(&self.db, &owner, path)?.unwrap_or_default();
        if let Some(clean) = &self.clean {
            if !blob.is_empty() {
                clean.insert(&cache_key, &blob);
                self.metrics.clean_node_write_bytes.increment(blob.len() as u64);
            }
        }
        let hash = keccak256(&blob);
        Ok((Bytes::from(blob), hash, NodeLoc { location: NodeLocation::DiskStore, depth }))
    }

    /// Retrieves an account blob from the dirty buffer.
    ///
    /// The persisted layout carries trie nodes only, so a buffer miss cannot
    /// fall through to disk and reports unsupported instead.
    pub fn account(&self, hash: B256, depth: usize) -> Result<Bytes, PathdbError> {
        let _guard = self.lock.read();
        if self.is_stale() {
            return Err(PathdbError::SnapshotStale);
        }
        if let Some(blob) = self.buffer.account(&hash) {
            self.metrics.dirty_state_hit.increment(1);
            self.metrics.dirty_state_read_bytes.increment(blob.len() as u64);
            self.metrics.dirty_state_hit_depth.record(depth as f64);
            if blob.is_empty() {
                self.metrics.account_missing.increment(1);
            } else {
                self.metrics.account_exists.increment(1);
            }
            return Ok(blob);
        }
        self.metrics.dirty_state_miss.increment(1);
        Err(StorageError::NotSupported("persistent state retrieval").into())
    }

    /// Retrieves a storage slot blob from the dirty buffer.
    ///
    /// See [`Self::account`] for why a miss cannot reach disk.
    pub fn storage(
        &self,
        account_hash: B256,
        slot_hash: B256,
        depth: usize,
    ) -> Result<Bytes, PathdbError> {
        let _guard = self.lock.read();
        if self.is_stale() {
            return Err(PathdbError::SnapshotStale);
        }
        if let Some(blob) = self.buffer.storage(&account_hash, &slot_hash) {
            self.metrics.dirty_state_hit.increment(1);
            self.metrics.dirty_state_read_bytes.increment(blob.len() as u64);
            self.metrics.dirty_state_hit_depth.record(depth as f64);
            if blob.is_empty() {
                self.metrics.storage_missing.increment(1);
            } else {
                self.metrics.storage_exists.increment(1);
            }
            return Ok(blob);
        }
        self.metrics.dirty_state_miss.increment(1);
        Err(StorageError::NotSupported("persistent state retrieval").into())
    }

    /// Merges the bottom-most diff layer into the write-back buffer and
    /// returns the successor disk layer.
    pub(crate) fn commit(
        &self,
        bottom: &Arc<DiffLayer>,
        force: bool,
    ) -> Result<Arc<DiskLayer>, PathdbError> {
        let _guard = self.lock.write();

        // Construct and store the state history first. If a crash lands
        // after the history write but before the matching state flush, the
        // dangling record is truncated from head on the next start.
        let mut overflow = false;
        let mut oldest = 0u64;
        if let Some(freezer) = &self.freezer {
            history::write_history(freezer.as_ref(), bottom)?;

            let tail = freezer.tail()?;
            let limit = self.config.state_history;
            if limit != 0 && bottom.state_id() - tail > limit {
                overflow = true;
                // Id of the oldest history after truncation.
                oldest = bottom.state_id() - limit + 1;
            }
        }
        // No mutation may land on this layer once a child commits on top.
        self.mark_stale();

        // Store the root → id lookups. Roots are unique across the chain,
        // adjacent blocks can never share one.
        if self.id == 0 {
            schema::put_state_id(&self.db, &self.root, 0)?;
        }
        schema::put_state_id(&self.db, &bottom.root(), bottom.state_id())?;

        // If the oldest retained history would overtake the persisted state
        // id, force the flush so rollback coverage never has a gap.
        let mut force = force;
        if !force && schema::read_persistent_state_id(&self.db)? < oldest {
            force = true;
        }

        self.buffer.commit(bottom.nodes(), bottom.states().state());
        self.buffer.flush(
            self.db.clone(),
            self.freezer.clone(),
            self.clean.clone(),
            bottom.state_id(),
            force,
        )?;

        let ndl = Arc::new(Self::new(
            bottom.root(),
            bottom.state_id(),
            self.db.clone(),
            self.freezer.clone(),
            self.clean.clone(),
            self.buffer.clone(),
            self.lookup.clone(),
            self.config.clone(),
        ));

        if overflow {
            if let Some(freezer) = &self.freezer {
                let pruned =
                    history::truncate_from_tail(&self.db, freezer.as_ref(), oldest - 1)?;
                debug!(target: "pathdb", pruned, tail_id = oldest, "Pruned state history");
            }
        }

        // The bottom diff was swallowed; its flat lookup index dies with it.
        self.lookup.remove(&bottom.root());
        Ok(ndl)
    }

    /// Applies one history record in reverse and returns the predecessor
    /// disk layer.
    pub(crate) fn revert(
        &self,
        history: &History,
        rewinder: &dyn StateRewinder,
    ) -> Result<Arc<DiskLayer>, PathdbError> {
        if history.meta.root != self.root {
            return Err(PathdbError::UnexpectedHistory);
        }
        if self.id == 0 {
            return Err(PathdbError::StateUnrecoverable);
        }
        // Compute the forward node changes restoring the parent roots. This
        // reads state through this still-live layer, so it must happen
        // before the stale tag goes up.
        let (accounts, storages) = history.state_set();
        let nodes =
            rewinder.rewind(history.meta.parent_root, history.meta.root, &accounts, &storages)?;

        let _guard = self.lock.write();
        self.mark_stale();

        // The transition being unwound either still sits in the buffer or
        // has reached the persistent state; patch whichever holds it.
        if !self.buffer.is_empty() {
            self.buffer.revert_to(&self.db, &nodes, &accounts, &storages)?;
        } else {
            let set = NodeSet::new(nodes);
            let mut batch = WriteBatch::with_size_hint(set.db_size());
            set.write(&mut batch, self.clean.as_deref());
            schema::put_persistent_state_id(&mut batch, self.id - 1);
            self.db.write_batch(batch)?;
        }
        Ok(Arc::new(Self::new(
            history.meta.parent_root,
            self.id - 1,
            self.db.clone(),
            self.freezer.clone(),
            self.clean.clone(),
            self.buffer.clone(),
            self.lookup.clone(),
            self.config.clone(),
        )))
    }

    /// Returns the approximate size of buffered content.
    pub fn buffered_size(&self) -> u64 {
        let _guard = self.lock.read();
        if self.is_stale() {
            return 0;
        }
        self.buffer.size()
    }

    /// Releases the memory held by the clean cache.
    pub fn reset_clean_cache(&self) {
        let _guard = self.lock.read();
        // A stale layer no longer owns the cache.
        if self.is_stale() {
            return;
        }
        if let Some(clean) = &self.clean {
            clean.reset();
        }
    }

    pub(crate) fn buffer(&self) -> &Arc<NodeBuffer> {
        &self.buffer
    }

    pub(crate) fn lookup_cache(&self) -> &Arc<LookupCache> {
        &self.lookup
    }
}
