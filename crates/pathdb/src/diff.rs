use crate::{
    cache::{flat_get, FlatIndex, LookupCache},
    layer::{Layer, NodeLoc, NodeLocation},
    nodes::NodeSet,
    states::StateSetWithOrigin,
    PathdbError,
};
use alloy_primitives::{Bytes, B256};
use nybbles::Nibbles;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

/// An immutable in-memory state delta on top of its parent layer.
///
/// Content is fixed at construction; the only mutable part is the parent
/// handle, which the layer tree rewires when the layer below is flattened
/// into disk. Lookups lazily flatten the two-level node map into a
/// single-probe index shared through the [`LookupCache`].
#[derive(Debug)]
pub struct DiffLayer {
    root: B256,
    id: u64,
    block: u64,
    nodes: NodeSet,
    states: StateSetWithOrigin,
    memory: u64,
    parent: RwLock<Layer>,
    cache: Arc<LookupCache>,
}

impl DiffLayer {
    /// Creates a new diff layer on top of `parent`.
    pub(crate) fn new(
        parent: Layer,
        root: B256,
        id: u64,
        block: u64,
        nodes: NodeSet,
        states: StateSetWithOrigin,
    ) -> Self {
        debug_assert_eq!(id, parent.state_id() + 1, "state ids must be adjacent");
        let cache = match &parent {
            Layer::Diff(diff) => diff.cache.clone(),
            Layer::Disk(disk) => disk.lookup_cache().clone(),
        };
        let memory = nodes.size() + states.size();
        trace!(
            target: "pathdb",
            %root,
            id,
            block,
            nodes = nodes.len(),
            "Created new diff layer"
        );
        Self { root, id, block, nodes, states, memory, parent: RwLock::new(parent), cache }
    }

    /// Returns the root hash of the state this layer represents.
    pub fn root(&self) -> B256 {
        self.root
    }

    /// Returns the state id of this layer.
    pub fn state_id(&self) -> u64 {
        self.id
    }

    /// Returns the number of the block that produced this state.
    pub fn block(&self) -> u64 {
        self.block
    }

    /// Returns the approximate memory held by this layer.
    pub fn memory(&self) -> u64 {
        self.memory
    }

    /// Returns a handle to the parent layer.
    pub fn parent(&self) -> Layer {
        self.parent.read().clone()
    }

    /// Rewires the parent handle after the layer below was flattened.
    pub(crate) fn set_parent(&self, parent: Layer) {
        *self.parent.write() = parent;
    }

    /// Returns the node delta of this layer.
    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    /// Returns the state delta of this layer, with pre-images.
    pub fn states(&self) -> &StateSetWithOrigin {
        &self.states
    }

    /// Retrieves a trie node, consulting the flat index of this layer before
    /// descending to the parent.
    pub fn node(
        &self,
        owner: B256,
        path: &Nibbles,
        hash: B256,
        depth: usize,
    ) -> Result<(Bytes, B256, NodeLoc), PathdbError> {
        let index = self.cache.get_or_build(self.root, || self.build_index());
        if let Some(node) = flat_get(&index, &owner, path) {
            if node.hash != hash {
                return Err(PathdbError::UnexpectedNode {
                    owner,
                    path: path.clone(),
                    want: hash,
                    have: node.hash,
                });
            }
            return Ok((
                node.blob.clone(),
                node.hash,
                NodeLoc { location: NodeLocation::DiffLayer, depth },
            ));
        }
        self.parent().node(owner, path, hash, depth + 1)
    }

    /// Retrieves an account blob, descending to the parent on miss.
    pub fn account(&self, hash: B256, depth: usize) -> Result<Bytes, PathdbError> {
        if let Some(blob) = self.states.state().account(&hash) {
            return Ok(blob.clone());
        }
        self.parent().account(hash, depth + 1)
    }

    /// Retrieves a storage slot blob, descending to the parent on miss.
    pub fn storage(
        &self,
        account_hash: B256,
        slot_hash: B256,
        depth: usize,
    ) -> Result<Bytes, PathdbError> {
        if let Some(blob) = self.states.state().storage(&account_hash, &slot_hash) {
            return Ok(blob.clone());
        }
        self.parent().storage(account_hash, slot_hash, depth + 1)
    }

    /// Flattens the owner/path node map into a single-probe index.
    fn build_index(&self) -> FlatIndex {
        let mut index = FlatIndex::default();
        for (owner, subset) in self.nodes.as_map().iter() {
            for (path, node) in subset.iter() {
                index.insert((*owner, path.clone()), node.clone());
            }
        }
        index
    }
}
