use crate::{
    cache::CleanCache,
    metrics::BufferMetrics,
    node::TrieNode,
    nodes::{NodeMap, NodeSet},
    schema,
    states::StateSet,
    PathdbError,
};
use alloy_primitives::{map::B256Map, Bytes, B256};
use lamina_common::StorageSize;
use lamina_storage_api::{AncientStore, KeyValueReader, KeyValueStore, WriteBatch};
use nybbles::Nibbles;
use std::time::Instant;
use tracing::debug;

/// An aggregation of one or more flattened diff layers awaiting disk write.
///
/// The buffer content must be consulted before any disk access; it is
/// not-yet-written data. `layers` counts how many diff layers were folded in
/// since the last flush, which is also how far [`Buffer::revert_to`] can
/// unwind.
#[derive(Debug)]
pub struct Buffer {
    layers: u64,
    limit: u64,
    nodes: NodeSet,
    states: StateSet,
    metrics: BufferMetrics,
}

impl Buffer {
    /// Creates a buffer with the given memory allowance, seeded with the
    /// provided content.
    pub fn new(limit: u64, nodes: NodeSet, states: StateSet, layers: u64) -> Self {
        Self { layers, limit, nodes, states, metrics: BufferMetrics::default() }
    }

    /// Creates an empty buffer with the given memory allowance.
    pub fn empty(limit: u64) -> Self {
        Self::new(limit, NodeSet::default(), StateSet::default(), 0)
    }

    /// Returns the trie node under `(owner, path)`, if buffered.
    pub fn node(&self, owner: &B256, path: &Nibbles) -> Option<&TrieNode> {
        self.nodes.node(owner, path)
    }

    /// Returns the buffered account blob for `hash`, if any.
    pub fn account(&self, hash: &B256) -> Option<&Bytes> {
        self.states.account(hash)
    }

    /// Returns the buffered storage slot, if any.
    pub fn storage(&self, account_hash: &B256, slot_hash: &B256) -> Option<&Bytes> {
        self.states.storage(account_hash, slot_hash)
    }

    /// Folds another layer's deltas into the buffer.
    pub fn commit(&mut self, nodes: &NodeSet, states: &StateSet) {
        self.layers += 1;
        self.nodes.merge(nodes);
        self.states.merge(states);
    }

    /// Undoes the most recently committed layer using the supplied reverse
    /// patch. Fails with [`PathdbError::StateUnrecoverable`] if nothing is
    /// buffered.
    pub fn revert_to(
        &mut self,
        db: &dyn KeyValueReader,
        nodes: &NodeMap,
        accounts: &B256Map<Bytes>,
        storages: &B256Map<B256Map<Bytes>>,
    ) -> Result<(), PathdbError> {
        if self.layers == 0 {
            return Err(PathdbError::StateUnrecoverable);
        }
        self.layers -= 1;

        // The only buffered transition was unwound; drop everything.
        if self.layers == 0 {
            self.reset();
            return Ok(());
        }
        self.nodes.revert_to(db, nodes)?;
        self.states.revert_to(accounts, storages);
        Ok(())
    }

    /// Persists the buffered content if the memory threshold is reached or
    /// `force` is set. All data lands in one atomic batch.
    pub(crate) fn flush(
        &mut self,
        db: &dyn KeyValueStore,
        freezer: Option<&dyn AncientStore>,
        clean: Option<&CleanCache>,
        id: u64,
        force: bool,
    ) -> Result<(), PathdbError> {
        if !self.is_full() && !force {
            return Ok(());
        }
        self.write_out(db, freezer, clean, id)?;
        self.reset();
        Ok(())
    }

    /// Builds and writes the flush batch without mutating the buffer; the
    /// caller resets afterwards. Split out so the async variant can write
    /// under a shared borrow.
    pub(crate) fn write_out(
        &self,
        db: &dyn KeyValueStore,
        freezer: Option<&dyn AncientStore>,
        clean: Option<&CleanCache>,
        id: u64,
    ) -> Result<(), PathdbError> {
        // Ensure the target state id is aligned with the persisted counter.
        let persisted = schema::read_persistent_state_id(db)?;
        if persisted + self.layers != id {
            return Err(PathdbError::Alignment { layers: self.layers, persisted, requested: id });
        }
        let start = Instant::now();

        // Sync the state freezer first so the history matching this flush is
        // durable before the key-value store moves past it.
        if let Some(freezer) = freezer {
            freezer.sync()?;
        }
        let mut batch = WriteBatch::with_size_hint(self.nodes.db_size() * 11 / 10);
        let nodes = self.nodes.write(&mut batch, clean);
        schema::put_persistent_state_id(&mut batch, id);

        let size = batch.value_size();
        db.write_batch(batch)?;

        self.metrics.commit_bytes.increment(size as u64);
        self.metrics.commit_nodes.increment(nodes as u64);
        self.metrics.commit_time_seconds.record(start.elapsed().as_secs_f64());
        debug!(
            target: "pathdb",
            nodes,
            bytes = %StorageSize::from(size),
            elapsed = ?start.elapsed(),
            "Persisted buffer content"
        );
        Ok(())
    }

    /// Clears the buffer, keeping the memory allowance.
    pub fn reset(&mut self) {
        self.layers = 0;
        self.nodes.reset();
        self.states.reset();
    }

    /// Returns whether no transition is buffered.
    pub fn is_empty(&self) -> bool {
        self.layers == 0
    }

    /// Returns whether the accumulated content exceeds the allowance.
    pub fn is_full(&self) -> bool {
        self.size() > self.limit
    }

    /// Returns the approximate size of the held content.
    pub fn size(&self) -> u64 {
        self.states.size() + self.nodes.size()
    }

    /// Returns the number of folded-in layers.
    pub fn layers(&self) -> u64 {
        self.layers
    }

    /// Returns the configured memory allowance.
    pub(crate) fn limit(&self) -> u64 {
        self.limit
    }

    /// Folds this buffer's content on top of `older`, producing a combined
    /// buffer. Used by the async variant to reconcile an unflushed
    /// background buffer with the live one.
    pub(crate) fn absorb_older(&mut self, mut older: Buffer) {
        older.nodes.merge(&self.nodes);
        older.states.merge(&self.states);
        older.layers += self.layers;
        *self = older;
    }
}
