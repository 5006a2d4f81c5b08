use crate::{
    buffer_async::NodeBuffer,
    cache::{CleanCache, LookupCache},
    disk::DiskLayer,
    history,
    layer::Layer,
    nodes::{NodeMap, NodeSet},
    schema,
    states::StateSetWithOrigin,
    PathdbError,
};
use alloy_primitives::{map::B256Map, Bytes, B256};
use lamina_storage_api::{AncientStore, KeyValueStore};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Computes the forward trie-node mutations that rewind a state.
///
/// The engine stores pre-images, not node diffs; turning one into the other
/// requires walking the live tries, which stay outside the engine. The
/// execution layer supplies an implementation backed by its trie machinery.
pub trait StateRewinder: Send + Sync {
    /// Returns the node changes that turn the trie rooted at `root` back
    /// into the one rooted at `parent_root`, given the pre-images of every
    /// account and storage slot the forward transition modified.
    fn rewind(
        &self,
        parent_root: B256,
        root: B256,
        accounts: &B256Map<Bytes>,
        storages: &B256Map<B256Map<Bytes>>,
    ) -> Result<NodeMap, PathdbError>;
}

/// Tuning knobs of the engine.
#[derive(Clone, Debug)]
pub struct Config {
    /// Diff layers kept in memory before the oldest is flattened into the
    /// disk layer.
    pub max_diff_layers: usize,
    /// Memory allowance of the clean node cache in bytes; zero disables the
    /// cache.
    pub clean_cache_size: usize,
    /// Memory allowance of the write-back buffer in bytes.
    pub buffer_limit: u64,
    /// Number of recent state histories to retain; zero keeps everything.
    pub state_history: u64,
    /// Flush the buffer on the committing thread instead of a background
    /// one.
    pub sync_flush: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_diff_layers: 128,
            clean_cache_size: 16 * 1024 * 1024,
            buffer_limit: 64 * 1024 * 1024,
            state_history: 90_000,
            sync_flush: false,
        }
    }
}

impl Config {
    /// Sets the number of retained diff layers.
    pub fn with_max_diff_layers(mut self, layers: usize) -> Self {
        self.max_diff_layers = layers;
        self
    }

    /// Sets the clean cache allowance.
    pub fn with_clean_cache_size(mut self, bytes: usize) -> Self {
        self.clean_cache_size = bytes;
        self
    }

    /// Sets the write-back buffer allowance.
    pub fn with_buffer_limit(mut self, bytes: u64) -> Self {
        self.buffer_limit = bytes;
        self
    }

    /// Sets the state-history retention bound.
    pub fn with_state_history(mut self, histories: u64) -> Self {
        self.state_history = histories;
        self
    }

    /// Selects synchronous buffer flushing.
    pub fn with_sync_flush(mut self, sync: bool) -> Self {
        self.sync_flush = sync;
        self
    }
}

/// The layered state engine.
///
/// One instance owns the whole layer stack. All structural operations
/// (`update`, `commit`, `recover`) are serialized; reads through [`Layer`]
/// handles run concurrently.
#[derive(Debug)]
pub struct Database {
    db: Arc<dyn KeyValueStore>,
    freezer: Option<Arc<dyn AncientStore>>,
    tree: crate::tree::LayerTree,
    config: Arc<Config>,
    lock: Mutex<()>,
}

impl Database {
    /// Opens the engine over the given backends, starting from `base_root`.
    ///
    /// The disk layer resumes at the persisted state id. State histories
    /// recorded past that id belong to flushes that never completed; they
    /// are truncated from the head before the engine goes live.
    pub fn new(
        db: Arc<dyn KeyValueStore>,
        freezer: Option<Arc<dyn AncientStore>>,
        base_root: B256,
        config: Config,
    ) -> Result<Self, PathdbError> {
        let config = Arc::new(config);
        let persisted = schema::read_persistent_state_id(&db)?;
        if let Some(freezer) = &freezer {
            let head = history::head_id(freezer.as_ref())?;
            if head > persisted {
                let removed = history::truncate_from_head(&db, freezer.as_ref(), persisted)?;
                debug!(
                    target: "pathdb",
                    removed,
                    persisted,
                    "Truncated dangling state histories"
                );
            }
        }
        let clean = (config.clean_cache_size > 0)
            .then(|| Arc::new(CleanCache::new(config.clean_cache_size)));
        let buffer = Arc::new(NodeBuffer::new(config.sync_flush, config.buffer_limit));
        let lookup = Arc::new(LookupCache::new(config.max_diff_layers as u32 + 8));
        let disk = Arc::new(DiskLayer::new(
            base_root,
            persisted,
            db.clone(),
            freezer.clone(),
            clean,
            buffer,
            lookup,
            config.clone(),
        ));
        info!(
            target: "pathdb",
            root = %base_root,
            id = persisted,
            sync_flush = config.sync_flush,
            "Opened path database"
        );
        Ok(Self {
            db,
            freezer,
            tree: crate::tree::LayerTree::new(Layer::Disk(disk)),
            config,
            lock: Mutex::new(()),
        })
    }

    /// Returns the layer registered under `root`, the entry point for
    /// reads.
    pub fn layer(&self, root: B256) -> Option<Layer> {
        self.tree.get(root)
    }

    /// Publishes the state delta of one block as a diff layer on top of
    /// `parent_root`, then flattens layers beyond the configured depth.
    pub fn update(
        &self,
        root: B256,
        parent_root: B256,
        block: u64,
        nodes: NodeSet,
        states: StateSetWithOrigin,
    ) -> Result<(), PathdbError> {
        let _guard = self.lock.lock();
        self.tree.add(root, parent_root, block, nodes, states)?;
        // Keep the configured number of diff layers in memory; the
        // persistent layer sits below them.
        self.tree.cap(root, self.config.max_diff_layers)
    }

    /// Flattens every layer between `root` and the disk layer and flushes
    /// the buffer, leaving `root` as the persisted state.
    pub fn commit(&self, root: B256) -> Result<(), PathdbError> {
        let _guard = self.lock.lock();
        self.tree.cap(root, 0)
    }

    /// Returns whether `root` is an unavailable state restorable through
    /// the history log.
    pub fn recoverable(&self, root: B256) -> bool {
        let Ok(Some(id)) = schema::read_state_id(&self.db, &root) else { return false };
        let disk = self.tree.bottom();
        if id >= disk.state_id() {
            return false;
        }
        let Some(freezer) = &self.freezer else { return false };
        // Every history in (id, disk] must be present to walk back.
        let Ok(tail) = history::tail_id(freezer.as_ref()) else { return false };
        let Ok(head) = history::head_id(freezer.as_ref()) else { return false };
        tail != 0 && tail <= id + 1 && head >= disk.state_id()
    }

    /// Rolls the disk layer back to `root` by applying history records in
    /// descending id order, then resets the layer tree onto the recovered
    /// base. All in-memory diff layers are discarded.
    pub fn recover(&self, root: B256, rewinder: &dyn StateRewinder) -> Result<(), PathdbError> {
        let _guard = self.lock.lock();
        if !self.recoverable(root) {
            return Err(PathdbError::StateUnrecoverable);
        }
        let freezer = self.freezer.as_ref().expect("recoverable implies a freezer");

        let mut disk = self.tree.bottom();
        while disk.root() != root {
            let record = history::read_history(freezer.as_ref(), disk.state_id())?;
            disk = disk.revert(&record, rewinder)?;
        }
        self.tree.reset(Layer::Disk(disk.clone()));

        // The unwound transitions are gone for good; drop their histories.
        let removed = history::truncate_from_head(&self.db, freezer.as_ref(), disk.state_id())?;
        info!(
            target: "pathdb",
            root = %root,
            id = disk.state_id(),
            removed,
            "Recovered state from history"
        );
        Ok(())
    }

    /// Returns the memory held by diff layers and by the write-back buffer.
    pub fn size(&self) -> (u64, u64) {
        (self.tree.diff_memory(), self.tree.bottom().buffered_size())
    }

    /// Returns the number of live layers, the disk layer included.
    pub fn layer_count(&self) -> usize {
        self.tree.len()
    }

    /// Drains any outstanding background flush and stops further ones.
    /// Call before dropping the engine on shutdown.
    pub fn close(&self) {
        let _guard = self.lock.lock();
        self.tree.bottom().buffer().wait_and_stop_flushing();
    }
}
