use alloy_primitives::B256;
use lamina_storage_api::StorageError;
use nybbles::Nibbles;
use thiserror::Error;

/// Errors produced by the layered state engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathdbError {
    /// A read hit a layer that is no longer current; the caller must retry
    /// against the live root.
    #[error("snapshot stale")]
    SnapshotStale,
    /// The history record handed to a revert does not extend the disk layer.
    #[error("unexpected state history")]
    UnexpectedHistory,
    /// The requested state cannot be restored, either because no transition
    /// is buffered or because the disk layer sits at state id zero.
    #[error("state is unrecoverable")]
    StateUnrecoverable,
    /// A diff-layer node carried a different hash than the lookup expected.
    #[error("unexpected node (owner {owner}, path {path:?}, want {want}, have {have})")]
    UnexpectedNode {
        /// Trie owner of the node.
        owner: B256,
        /// Path of the node within its trie.
        path: Nibbles,
        /// Hash the caller expected.
        want: B256,
        /// Hash the layer holds.
        have: B256,
    },
    /// No live layer is registered under the given root.
    #[error("layer {0} missing")]
    LayerMissing(B256),
    /// The operation requires a diff layer but the root resolves elsewhere.
    #[error("layer {0} is not a diff layer")]
    NotDiffLayer(B256),
    /// A diff layer was proposed with itself as parent.
    #[error("layer cycle at {0}")]
    LayerCycle(B256),
    /// Buffer flush requested against a state id the buffered layers cannot
    /// reach from the persisted one.
    #[error(
        "buffer layers ({layers}) cannot be applied on top of persisted state id ({persisted}) \
         to reach requested state id ({requested})"
    )]
    Alignment {
        /// Number of aggregated layers in the buffer.
        layers: u64,
        /// State id currently persisted on disk.
        persisted: u64,
        /// State id the flush was asked to reach.
        requested: u64,
    },
    /// A state-history blob failed to decode.
    #[error("corrupted state history: {0}")]
    Decode(&'static str),
    /// Failure in the underlying storage backend.
    #[error(transparent)]
    Storage(#[from] StorageError),
}
