use metrics::{counter, histogram, Counter, Histogram};

/// Read-path meters of the disk layer.
pub(crate) struct DiskLayerMetrics {
    pub(crate) dirty_node_hit: Counter,
    pub(crate) dirty_node_miss: Counter,
    pub(crate) dirty_node_read_bytes: Counter,
    pub(crate) dirty_node_hit_depth: Histogram,
    pub(crate) clean_node_hit: Counter,
    pub(crate) clean_node_miss: Counter,
    pub(crate) clean_node_read_bytes: Counter,
    pub(crate) clean_node_write_bytes: Counter,
    pub(crate) dirty_state_hit: Counter,
    pub(crate) dirty_state_miss: Counter,
    pub(crate) dirty_state_read_bytes: Counter,
    pub(crate) dirty_state_hit_depth: Histogram,
    pub(crate) account_exists: Counter,
    pub(crate) account_missing: Counter,
    pub(crate) storage_exists: Counter,
    pub(crate) storage_missing: Counter,
}

impl Default for DiskLayerMetrics {
    fn default() -> Self {
        Self {
            dirty_node_hit: counter!("pathdb.dirty.node.hit"),
            dirty_node_miss: counter!("pathdb.dirty.node.miss"),
            dirty_node_read_bytes: counter!("pathdb.dirty.node.read"),
            dirty_node_hit_depth: histogram!("pathdb.dirty.node.hit.depth"),
            clean_node_hit: counter!("pathdb.clean.node.hit"),
            clean_node_miss: counter!("pathdb.clean.node.miss"),
            clean_node_read_bytes: counter!("pathdb.clean.node.read"),
            clean_node_write_bytes: counter!("pathdb.clean.node.write"),
            dirty_state_hit: counter!("pathdb.dirty.state.hit"),
            dirty_state_miss: counter!("pathdb.dirty.state.miss"),
            dirty_state_read_bytes: counter!("pathdb.dirty.state.read"),
            dirty_state_hit_depth: histogram!("pathdb.dirty.state.hit.depth"),
            account_exists: counter!("pathdb.state.account.exist"),
            account_missing: counter!("pathdb.state.account.inex"),
            storage_exists: counter!("pathdb.state.storage.exist"),
            storage_missing: counter!("pathdb.state.storage.inex"),
        }
    }
}

impl core::fmt::Debug for DiskLayerMetrics {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DiskLayerMetrics").finish_non_exhaustive()
    }
}

/// Flush meters of the write-back buffer.
pub(crate) struct BufferMetrics {
    pub(crate) commit_bytes: Counter,
    pub(crate) commit_nodes: Counter,
    pub(crate) commit_time_seconds: Histogram,
}

impl Default for BufferMetrics {
    fn default() -> Self {
        Self {
            commit_bytes: counter!("pathdb.commit.bytes"),
            commit_nodes: counter!("pathdb.commit.nodes"),
            commit_time_seconds: histogram!("pathdb.commit.time"),
        }
    }
}

impl core::fmt::Debug for BufferMetrics {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferMetrics").finish_non_exhaustive()
    }
}
