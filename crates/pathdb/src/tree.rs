use crate::{
    diff::DiffLayer, disk::DiskLayer, layer::Layer, nodes::NodeSet, states::StateSetWithOrigin,
    PathdbError,
};
use alloy_primitives::{map::B256Map, B256};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

/// The set of live layers, keyed by state root.
///
/// Layers form a tree rooted at the single disk layer: every diff has
/// exactly one parent, forks share ancestors. Lookups take the shared lock;
/// structural changes (`add`, `cap`, `reset`) take the exclusive one.
#[derive(Debug)]
pub(crate) struct LayerTree {
    layers: RwLock<B256Map<Layer>>,
}

impl LayerTree {
    /// Creates a tree holding the given base layer.
    pub(crate) fn new(base: Layer) -> Self {
        let mut layers = B256Map::default();
        layers.insert(base.root(), base);
        Self { layers: RwLock::new(layers) }
    }

    /// Returns the layer registered under `root`.
    pub(crate) fn get(&self, root: B256) -> Option<Layer> {
        self.layers.read().get(&root).cloned()
    }

    /// Returns the number of live layers, the disk layer included.
    pub(crate) fn len(&self) -> usize {
        self.layers.read().len()
    }

    /// Returns the disk layer at the bottom of the tree.
    pub(crate) fn bottom(&self) -> Arc<DiskLayer> {
        self.layers
            .read()
            .values()
            .find_map(|layer| layer.as_disk().cloned())
            .expect("layer tree always holds a disk layer")
    }

    /// Sum of the memory held by all diff layers.
    pub(crate) fn diff_memory(&self) -> u64 {
        self.layers
            .read()
            .values()
            .filter_map(|layer| layer.as_diff().map(|diff| diff.memory()))
            .sum()
    }

    /// Publishes a new diff layer for `root` on top of `parent_root`.
    ///
    /// Re-adding a known root is a no-op: identical blocks produce identical
    /// layers and the first publication wins.
    pub(crate) fn add(
        &self,
        root: B256,
        parent_root: B256,
        block: u64,
        nodes: NodeSet,
        states: StateSetWithOrigin,
    ) -> Result<(), PathdbError> {
        if root == parent_root {
            return Err(PathdbError::LayerCycle(root));
        }
        let mut layers = self.layers.write();
        if layers.contains_key(&root) {
            return Ok(());
        }
        let parent =
            layers.get(&parent_root).cloned().ok_or(PathdbError::LayerMissing(parent_root))?;
        let diff = parent.update(root, parent.state_id() + 1, block, nodes, states);
        layers.insert(root, Layer::Diff(Arc::new(diff)));
        Ok(())
    }

    /// Flattens diff layers until at most `depth` of them remain between
    /// `root` and the disk layer. A depth of zero collapses the entire chain
    /// and force-flushes the buffer.
    pub(crate) fn cap(&self, root: B256, depth: usize) -> Result<(), PathdbError> {
        let head = self.get(root).ok_or(PathdbError::LayerMissing(root))?;
        let Layer::Diff(head) = head else { return Err(PathdbError::NotDiffLayer(root)) };

        let mut layers = self.layers.write();
        if depth == 0 {
            let base = Self::persist(&head, true)?;
            layers.clear();
            layers.insert(base.root(), Layer::Disk(base));
            return Ok(());
        }
        // Walk down `depth` layers; everything below the last retained diff
        // is flattened into disk.
        let mut retained = head;
        for _ in 0..depth - 1 {
            match retained.parent() {
                Layer::Diff(parent) => retained = parent,
                // The chain is shorter than the allowance.
                Layer::Disk(_) => return Ok(()),
            }
        }
        let bottom = match retained.parent() {
            Layer::Disk(_) => return Ok(()),
            Layer::Diff(parent) => parent,
        };
        let base = Self::persist(&bottom, false)?;
        trace!(
            target: "pathdb",
            root = %base.root(),
            id = base.state_id(),
            "Flattened diff layers into disk"
        );

        // The flattened diff's root is now the disk root; swap the entry,
        // re-point its children and prune everything that no longer reaches
        // the new base.
        layers.insert(base.root(), Layer::Disk(base.clone()));
        for layer in layers.values() {
            if let Layer::Diff(diff) = layer {
                if diff.parent().root() == base.root() && diff.parent().as_disk().is_none() {
                    diff.set_parent(Layer::Disk(base.clone()));
                }
            }
        }
        layers.retain(|_, layer| Self::reaches(layer, &base));
        Ok(())
    }

    /// Commits `diff` and every diff below it into the disk layer, bottom
    /// first, and returns the resulting disk layer.
    fn persist(diff: &Arc<DiffLayer>, force: bool) -> Result<Arc<DiskLayer>, PathdbError> {
        let disk = match diff.parent() {
            Layer::Diff(parent) => {
                let disk = Self::persist(&parent, force)?;
                // The recorded parent was flattened away; the commit below
                // must run against its successor.
                diff.set_parent(Layer::Disk(disk.clone()));
                disk
            }
            Layer::Disk(disk) => disk,
        };
        disk.commit(diff, force)
    }

    /// Whether `layer`'s ancestor chain ends at `base`.
    fn reaches(layer: &Layer, base: &Arc<DiskLayer>) -> bool {
        let mut current = layer.clone();
        loop {
            match current {
                Layer::Disk(disk) => return Arc::ptr_eq(&disk, base),
                Layer::Diff(diff) => current = diff.parent(),
            }
        }
    }

    /// Replaces the whole tree with a single base layer; used after reorg
    /// recovery rebuilt the disk layer.
    pub(crate) fn reset(&self, base: Layer) {
        let mut layers = self.layers.write();
        layers.clear();
        layers.insert(base.root(), base);
    }
}
