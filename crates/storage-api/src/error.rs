use thiserror::Error;

/// Result alias for storage backend operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors produced by storage backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// An ancient store read past the retained range.
    #[error("ancient item {id} out of bounds (tail {tail}, head {head})")]
    OutOfBounds {
        /// Requested item id.
        id: u64,
        /// First retained item id.
        tail: u64,
        /// Next item id to be appended.
        head: u64,
    },
    /// The backend variant does not implement the requested operation.
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    /// The requested table does not exist in this backend.
    #[error("unknown table: {0}")]
    UnknownTable(&'static str),
    /// An ancient append arrived out of order.
    #[error("out of order ancient append: have {have}, want {want}")]
    OutOfOrderAppend {
        /// Item id supplied by the caller.
        have: u64,
        /// Expected item id, i.e. the current head.
        want: u64,
    },
    /// Backend specific failure.
    #[error("storage backend: {0}")]
    Backend(String),
}
