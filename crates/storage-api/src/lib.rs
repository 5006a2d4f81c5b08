//! Contracts between the lamina state engine and its storage backends.
//!
//! The engine consumes three collaborator surfaces: a key-value store with
//! atomic batch writes ([`KeyValueStore`]), an append-only ancient store for
//! state history ([`AncientStore`]), and read access to the merkle tries
//! ([`Trie`] / [`TrieOpener`]). Everything here is backend agnostic; the
//! in-memory implementations double as test fixtures and as the storage for
//! ephemeral deployments.

mod ancient;
mod error;
mod kv;
mod mem;
mod pruned;
mod trie;

pub use ancient::AncientStore;
pub use error::{StorageError, StorageResult};
pub use kv::{BatchOp, KeyValueReader, KeyValueStore, WriteBatch};
pub use mem::{MemoryAncientStore, MemoryStore};
pub use pruned::{PrunedAncientStore, FROZEN_WATERMARK_KEY};
pub use trie::{Trie, TrieOpener};
