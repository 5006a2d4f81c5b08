//! Persisted key layout of the engine.
//!
//! Trie nodes are addressed by their path from the owning trie's root:
//! account-trie nodes under `"A" + path`, storage-trie nodes under
//! `"S" + owner + path`, with paths stored one nibble per byte. Next to the
//! nodes live a handful of scalar markers: the persisted state id, the
//! `root → state id` lookups consumed by reorg recovery, and the frozen
//! watermark / snapshot generation markers maintained for the ancient store
//! and the external snapshot subsystem.

use crate::PathdbError;
use alloy_primitives::B256;
use lamina_storage_api::{KeyValueReader, KeyValueStore, WriteBatch};
use nybbles::Nibbles;

/// Prefix of account-trie node keys.
pub const ACCOUNT_TRIE_NODE_PREFIX: &[u8] = b"A";
/// Prefix of storage-trie node keys.
pub const STORAGE_TRIE_NODE_PREFIX: &[u8] = b"S";
/// Prefix of `root → state id` lookup keys.
pub const STATE_ID_PREFIX: &[u8] = b"L";
/// Key of the state id whose trie data is fully persisted.
pub const PERSISTENT_STATE_ID_KEY: &[u8] = b"PersistentStateID";
/// Key of the snapshot generation marker maintained for the external
/// snapshot subsystem.
pub const SNAPSHOT_GENERATION_KEY: &[u8] = b"SnapshotGeneration";

pub use lamina_storage_api::FROZEN_WATERMARK_KEY;

/// Returns the database key of an account-trie node.
pub fn account_trie_node_key(path: &Nibbles) -> Vec<u8> {
    let mut key = Vec::with_capacity(ACCOUNT_TRIE_NODE_PREFIX.len() + path.len());
    key.extend_from_slice(ACCOUNT_TRIE_NODE_PREFIX);
    key.extend_from_slice(path.as_slice());
    key
}

/// Returns the database key of a storage-trie node.
pub fn storage_trie_node_key(owner: &B256, path: &Nibbles) -> Vec<u8> {
    let mut key =
        Vec::with_capacity(STORAGE_TRIE_NODE_PREFIX.len() + B256::len_bytes() + path.len());
    key.extend_from_slice(STORAGE_TRIE_NODE_PREFIX);
    key.extend_from_slice(owner.as_slice());
    key.extend_from_slice(path.as_slice());
    key
}

/// Returns the database key of a trie node, dispatching on the owner.
///
/// A zero owner denotes the account trie.
pub fn trie_node_key(owner: &B256, path: &Nibbles) -> Vec<u8> {
    if owner.is_zero() {
        account_trie_node_key(path)
    } else {
        storage_trie_node_key(owner, path)
    }
}

/// Reads a trie node blob from the database, `None` if absent.
pub fn read_trie_node(
    db: &dyn KeyValueReader,
    owner: &B256,
    path: &Nibbles,
) -> Result<Option<Vec<u8>>, PathdbError> {
    Ok(db.get(&trie_node_key(owner, path))?)
}

/// Reads the persisted state id, zero if never written.
pub fn read_persistent_state_id(db: &dyn KeyValueReader) -> Result<u64, PathdbError> {
    read_u64(db, PERSISTENT_STATE_ID_KEY)
}

/// Queues the persisted state id into `batch`.
pub fn put_persistent_state_id(batch: &mut WriteBatch, id: u64) {
    batch.put(PERSISTENT_STATE_ID_KEY.to_vec(), id.to_be_bytes().to_vec());
}

/// Reads the state id mapped to `root`, `None` if unmapped.
pub fn read_state_id(db: &dyn KeyValueReader, root: &B256) -> Result<Option<u64>, PathdbError> {
    let Some(raw) = db.get(&state_id_key(root))? else { return Ok(None) };
    Ok(Some(decode_u64(&raw)?))
}

/// Persists the `root → id` lookup.
pub fn put_state_id(db: &dyn KeyValueStore, root: &B256, id: u64) -> Result<(), PathdbError> {
    Ok(db.put(&state_id_key(root), &id.to_be_bytes())?)
}

/// Queues removal of the `root → id` lookup into `batch`.
pub fn delete_state_id(batch: &mut WriteBatch, root: &B256) {
    batch.delete(state_id_key(root));
}

/// Reads the snapshot generation marker, zero if never written.
pub fn read_snapshot_generation(db: &dyn KeyValueReader) -> Result<u64, PathdbError> {
    read_u64(db, SNAPSHOT_GENERATION_KEY)
}

/// Persists the snapshot generation marker.
pub fn put_snapshot_generation(db: &dyn KeyValueStore, generation: u64) -> Result<(), PathdbError> {
    Ok(db.put(SNAPSHOT_GENERATION_KEY, &generation.to_be_bytes())?)
}

fn state_id_key(root: &B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(STATE_ID_PREFIX.len() + B256::len_bytes());
    key.extend_from_slice(STATE_ID_PREFIX);
    key.extend_from_slice(root.as_slice());
    key
}

fn read_u64(db: &dyn KeyValueReader, key: &[u8]) -> Result<u64, PathdbError> {
    match db.get(key)? {
        Some(raw) => decode_u64(&raw),
        None => Ok(0),
    }
}

fn decode_u64(raw: &[u8]) -> Result<u64, PathdbError> {
    let bytes: [u8; 8] =
        raw.try_into().map_err(|_| PathdbError::Decode("malformed u64 marker"))?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::b256;
    use lamina_storage_api::MemoryStore;

    #[test]
    fn node_keys_separate_tries() {
        let path = Nibbles::from_nibbles([0x1, 0x2, 0x3]);
        let owner = b256!("00000000000000000000000000000000000000000000000000000000000000aa");

        assert_eq!(account_trie_node_key(&path), b"A\x01\x02\x03".to_vec());
        let storage_key = storage_trie_node_key(&owner, &path);
        assert_eq!(&storage_key[..1], b"S");
        assert_eq!(&storage_key[1..33], owner.as_slice());
        assert_eq!(&storage_key[33..], &[0x1, 0x2, 0x3]);

        assert_eq!(trie_node_key(&B256::ZERO, &path), account_trie_node_key(&path));
        assert_eq!(trie_node_key(&owner, &path), storage_key);
    }

    #[test]
    fn scalar_markers_round_trip() {
        let db = MemoryStore::new();
        assert_eq!(read_persistent_state_id(&db).unwrap(), 0);

        let mut batch = WriteBatch::new();
        put_persistent_state_id(&mut batch, 42);
        db.write_batch(batch).unwrap();
        assert_eq!(read_persistent_state_id(&db).unwrap(), 42);

        let root = b256!("00000000000000000000000000000000000000000000000000000000000000bb");
        assert_eq!(read_state_id(&db, &root).unwrap(), None);
        put_state_id(&db, &root, 7).unwrap();
        assert_eq!(read_state_id(&db, &root).unwrap(), Some(7));

        let mut batch = WriteBatch::new();
        delete_state_id(&mut batch, &root);
        db.write_batch(batch).unwrap();
        assert_eq!(read_state_id(&db, &root).unwrap(), None);
    }
}
