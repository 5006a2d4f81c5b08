use crate::{
    diff::DiffLayer, disk::DiskLayer, nodes::NodeSet, states::StateSetWithOrigin, PathdbError,
};
use alloy_primitives::{Bytes, B256};
use nybbles::Nibbles;
use std::sync::Arc;

/// Where a node lookup was satisfied, for read-path telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeLocation {
    /// The not-yet-flushed write-back buffer of the disk layer.
    DirtyBuffer,
    /// The clean node cache of the disk layer.
    CleanCache,
    /// The persistent key-value store.
    DiskStore,
    /// An in-memory diff layer.
    DiffLayer,
}

/// Resolved location of a node lookup, including how many layers were
/// descended to find it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeLoc {
    /// Which tier satisfied the lookup.
    pub location: NodeLocation,
    /// Number of diff layers between the entry layer and the hit.
    pub depth: usize,
}

/// A layer of the state stack: either an immutable in-memory diff or the
/// persistent disk layer at the bottom.
///
/// Cloning a layer clones a handle, not the content.
#[derive(Clone, Debug)]
pub enum Layer {
    /// An immutable in-memory delta above its parent.
    Diff(Arc<DiffLayer>),
    /// The persistent bottom of the stack.
    Disk(Arc<DiskLayer>),
}

impl Layer {
    /// Returns the root hash of the state this layer represents.
    pub fn root(&self) -> B256 {
        match self {
            Self::Diff(layer) => layer.root(),
            Self::Disk(layer) => layer.root(),
        }
    }

    /// Returns the id of the state transition this layer represents.
    pub fn state_id(&self) -> u64 {
        match self {
            Self::Diff(layer) => layer.state_id(),
            Self::Disk(layer) => layer.state_id(),
        }
    }

    /// Returns the parent layer, or `None` for the disk layer.
    pub fn parent(&self) -> Option<Layer> {
        match self {
            Self::Diff(layer) => Some(layer.parent()),
            Self::Disk(_) => None,
        }
    }

    /// Retrieves the trie node under `(owner, path)`, descending the stack
    /// until a value is found. `hash` is the hash the caller expects; diff
    /// layers verify it, the disk layer returns the actual hash for the
    /// caller to check.
    pub fn node(
        &self,
        owner: B256,
        path: &Nibbles,
        hash: B256,
        depth: usize,
    ) -> Result<(Bytes, B256, NodeLoc), PathdbError> {
        match self {
            Self::Diff(layer) => layer.node(owner, path, hash, depth),
            Self::Disk(layer) => layer.node(owner, path, depth),
        }
    }

    /// Retrieves the account blob for the hashed address, descending the
    /// stack. An empty blob means the account was deleted.
    pub fn account(&self, hash: B256, depth: usize) -> Result<Bytes, PathdbError> {
        match self {
            Self::Diff(layer) => layer.account(hash, depth),
            Self::Disk(layer) => layer.account(hash, depth),
        }
    }

    /// Retrieves a storage slot blob, descending the stack. An empty blob
    /// means the slot was cleared.
    pub fn storage(
        &self,
        account_hash: B256,
        slot_hash: B256,
        depth: usize,
    ) -> Result<Bytes, PathdbError> {
        match self {
            Self::Diff(layer) => layer.storage(account_hash, slot_hash, depth),
            Self::Disk(layer) => layer.storage(account_hash, slot_hash, depth),
        }
    }

    /// Builds a new diff layer on top of this one.
    pub fn update(
        &self,
        root: B256,
        id: u64,
        block: u64,
        nodes: NodeSet,
        states: StateSetWithOrigin,
    ) -> DiffLayer {
        DiffLayer::new(self.clone(), root, id, block, nodes, states)
    }

    /// Returns the disk layer if this is one.
    pub(crate) fn as_disk(&self) -> Option<&Arc<DiskLayer>> {
        match self {
            Self::Disk(layer) => Some(layer),
            Self::Diff(_) => None,
        }
    }

    /// Returns the diff layer if this is one.
    pub(crate) fn as_diff(&self) -> Option<&Arc<DiffLayer>> {
        match self {
            Self::Diff(layer) => Some(layer),
            Self::Disk(_) => None,
        }
    }
}
