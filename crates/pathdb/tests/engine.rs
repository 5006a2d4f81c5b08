//! End-to-end scenarios against the public engine API: block commits,
//! capping, buffer flushing and reorg recovery over in-memory backends.

use alloy_primitives::{
    keccak256,
    map::{B256Map, HashMap},
    Bytes, B256,
};
use lamina_pathdb::{
    schema, Config, Database, History, Layer, NodeLocation, NodeMap, NodeSet, PathdbError,
    StateRewinder, StateSet, StateSetWithOrigin, TrieNode, HISTORY_VERSION,
};
use lamina_storage_api::{AncientStore, KeyValueReader, MemoryAncientStore, MemoryStore};
use nybbles::Nibbles;
use std::sync::Arc;

fn root(tag: u64) -> B256 {
    keccak256(tag.to_be_bytes())
}

fn account_hash(name: &str) -> B256 {
    keccak256(name.as_bytes())
}

fn account_path(name: &str) -> Nibbles {
    Nibbles::unpack(account_hash(name).as_slice())
}

/// Builds the node and state delta of one block over a toy trie model where
/// each account owns a single leaf at the unpacked hash path. Entries are
/// `(name, pre-image, post-state)`; `None` means absent.
#[allow(clippy::type_complexity)]
fn delta(entries: &[(&str, Option<&[u8]>, Option<&[u8]>)]) -> (NodeSet, StateSetWithOrigin) {
    let mut subset: HashMap<Nibbles, TrieNode> = HashMap::default();
    let mut accounts = B256Map::default();
    let mut origin = B256Map::default();
    for &(name, pre, post) in entries {
        let hash = account_hash(name);
        let path = Nibbles::unpack(hash.as_slice());
        match post {
            Some(blob) => {
                subset.insert(path, TrieNode::leaf(Bytes::copy_from_slice(blob)));
                accounts.insert(hash, Bytes::copy_from_slice(blob));
            }
            None => {
                subset.insert(path, TrieNode::deleted());
                accounts.insert(hash, Bytes::new());
            }
        }
        origin.insert(hash, pre.map(Bytes::copy_from_slice).unwrap_or_default());
    }
    let mut nodes = NodeMap::default();
    nodes.insert(B256::ZERO, subset);
    (
        NodeSet::new(nodes),
        StateSetWithOrigin::new(
            StateSet::new(accounts, B256Map::default()),
            origin,
            B256Map::default(),
        ),
    )
}

/// Rewinds the toy trie model: the pre-image of each account maps straight
/// back onto its leaf node.
struct HashRewinder;

impl StateRewinder for HashRewinder {
    fn rewind(
        &self,
        _parent_root: B256,
        _root: B256,
        accounts: &B256Map<Bytes>,
        storages: &B256Map<B256Map<Bytes>>,
    ) -> Result<NodeMap, PathdbError> {
        let mut map = NodeMap::default();
        {
            let subset = map.entry(B256::ZERO).or_default();
            for (hash, pre) in accounts.iter() {
                let node = if pre.is_empty() {
                    TrieNode::deleted()
                } else {
                    TrieNode::leaf(pre.clone())
                };
                subset.insert(Nibbles::unpack(hash.as_slice()), node);
            }
        }
        for (owner, slots) in storages.iter() {
            let subset = map.entry(*owner).or_default();
            for (slot, pre) in slots.iter() {
                let node = if pre.is_empty() {
                    TrieNode::deleted()
                } else {
                    TrieNode::leaf(pre.clone())
                };
                subset.insert(Nibbles::unpack(slot.as_slice()), node);
            }
        }
        Ok(map)
    }
}

fn open(
    kv: &Arc<MemoryStore>,
    freezer: &Arc<MemoryAncientStore>,
    config: Config,
) -> Database {
    Database::new(kv.clone(), Some(freezer.clone() as _), B256::ZERO, config).unwrap()
}

#[test]
fn single_block_commit() {
    let kv = Arc::new(MemoryStore::new());
    let freezer = Arc::new(MemoryAncientStore::new());
    let db = open(&kv, &freezer, Config::default().with_sync_flush(true));

    let alice = account_hash("alice");
    let (nodes, states) = delta(&[("alice", None, Some(b"\xaa"))]);
    db.update(root(1), B256::ZERO, 1, nodes, states).unwrap();

    // The new state is readable through the diff layer, nothing persisted.
    let layer = db.layer(root(1)).unwrap();
    assert_eq!(layer.account(alice, 0).unwrap().as_ref(), b"\xaa");
    assert_eq!(layer.state_id(), 1);
    assert_eq!(schema::read_persistent_state_id(&kv).unwrap(), 0);

    db.commit(root(1)).unwrap();
    assert_eq!(schema::read_persistent_state_id(&kv).unwrap(), 1);

    // One history record, chaining the empty base to the new root, with the
    // pre-image recording that alice did not exist before.
    assert_eq!(freezer.head().unwrap(), 1);
    let record = History::decode(&freezer.read(0).unwrap()).unwrap();
    assert_eq!(record.meta.version, HISTORY_VERSION);
    assert_eq!(record.meta.parent_root, B256::ZERO);
    assert_eq!(record.meta.root, root(1));
    assert_eq!(record.accounts, vec![(alice, Bytes::new())]);
    assert!(record.storages.is_empty());
}

#[test]
fn revert_one_step() {
    let kv = Arc::new(MemoryStore::new());
    let freezer = Arc::new(MemoryAncientStore::new());
    let db = open(&kv, &freezer, Config::default().with_sync_flush(true));

    let (nodes, states) = delta(&[("alice", None, Some(b"\xaa"))]);
    db.update(root(1), B256::ZERO, 1, nodes, states).unwrap();
    db.commit(root(1)).unwrap();

    assert!(db.recoverable(B256::ZERO));
    db.recover(B256::ZERO, &HashRewinder).unwrap();

    // Back at the empty base: id zero, node gone, history head rolled back.
    assert_eq!(schema::read_persistent_state_id(&kv).unwrap(), 0);
    let base = db.layer(B256::ZERO).unwrap();
    assert_eq!(base.state_id(), 0);
    assert!(base.account(account_hash("alice"), 0).is_err());

    let empty_hash = keccak256([0u8; 0]);
    let (blob, _, _) = base.node(B256::ZERO, &account_path("alice"), empty_hash, 0).unwrap();
    assert!(blob.is_empty());

    assert_eq!(freezer.head().unwrap(), 0);
    assert_eq!(freezer.tail().unwrap(), 0);
}

#[test]
fn cap_depth_keeps_the_configured_window() {
    let kv = Arc::new(MemoryStore::new());
    let freezer = Arc::new(MemoryAncientStore::new());
    let db = open(&kv, &freezer, Config::default().with_sync_flush(true));

    let mut parent = B256::ZERO;
    let mut prev: Option<Vec<u8>> = None;
    for block in 1..=130u64 {
        let value = vec![block as u8];
        let (nodes, states) =
            delta(&[("alice", prev.as_deref(), Some(value.as_slice()))]);
        db.update(root(block), parent, block, nodes, states).unwrap();
        parent = root(block);
        prev = Some(value);
    }

    // 128 diffs survive on top of a disk layer that swallowed R1 and R2.
    assert_eq!(db.layer_count(), 129);
    assert!(db.layer(root(1)).is_none());
    assert!(db.layer(root(2)).is_some());
    assert!(matches!(db.layer(root(2)).unwrap(), Layer::Disk(_)));
    assert_eq!(db.layer(root(2)).unwrap().state_id(), 2);
    assert!(matches!(db.layer(root(3)).unwrap(), Layer::Diff(_)));

    // Two flattens produced two history records; nothing was flushed yet.
    assert_eq!(freezer.head().unwrap(), 2);
    assert_eq!(schema::read_persistent_state_id(&kv).unwrap(), 0);

    // Adjacent records chain through their roots.
    let first = History::decode(&freezer.read(0).unwrap()).unwrap();
    let second = History::decode(&freezer.read(1).unwrap()).unwrap();
    assert_eq!(first.meta.parent_root, B256::ZERO);
    assert_eq!(second.meta.parent_root, first.meta.root);
    assert_eq!(second.meta.root, root(2));

    // The head still sees the newest value through the whole stack.
    let head = db.layer(root(130)).unwrap();
    assert_eq!(head.account(account_hash("alice"), 0).unwrap().as_ref(), &[130u8][..]);
}

#[test]
fn buffer_full_triggers_flush_without_force() {
    let kv = Arc::new(MemoryStore::new());
    let freezer = Arc::new(MemoryAncientStore::new());
    let config = Config::default()
        .with_sync_flush(true)
        .with_buffer_limit(1024)
        .with_max_diff_layers(1);
    let db = open(&kv, &freezer, config);

    let names = ["a", "b", "c"];
    let mut parent = B256::ZERO;
    for (index, name) in names.iter().enumerate() {
        let value = vec![index as u8 + 1; 400];
        let (nodes, states) = delta(&[(name, None, Some(value.as_slice()))]);
        db.update(root(index as u64 + 1), parent, index as u64 + 1, nodes, states).unwrap();
        parent = root(index as u64 + 1);
    }

    // Flattening R1 buffered ~0.9 KiB, below the limit, so nothing was
    // flushed. Flattening R2 pushed the buffer past 1 KiB and must have
    // flushed both transitions without any force flag.
    assert_eq!(schema::read_persistent_state_id(&kv).unwrap(), 2);
    let (_, buffered) = db.size();
    assert_eq!(buffered, 0);

    // The flushed leaf is on disk under its account-trie key.
    let mut key = b"A".to_vec();
    key.extend_from_slice(account_path("a").as_slice());
    assert_eq!(kv.get(&key).unwrap(), Some(vec![1u8; 400]));
}

#[test]
fn lookups_descend_the_stack() {
    let kv = Arc::new(MemoryStore::new());
    let freezer = Arc::new(MemoryAncientStore::new());
    let db = open(&kv, &freezer, Config::default().with_sync_flush(true));

    let alice = account_hash("alice");
    let bob = account_hash("bob");

    let (nodes, states) = delta(&[("alice", None, Some(b"\xa1"))]);
    db.update(root(1), B256::ZERO, 1, nodes, states).unwrap();
    let (nodes, states) = delta(&[("bob", None, Some(b"\xb1"))]);
    db.update(root(2), root(1), 2, nodes, states).unwrap();
    let (nodes, states) = delta(&[("alice", Some(b"\xa1"), Some(b"\xa3"))]);
    db.update(root(3), root(2), 3, nodes, states).unwrap();

    // Every layer answers with the newest value at or below itself.
    assert_eq!(db.layer(root(3)).unwrap().account(alice, 0).unwrap().as_ref(), b"\xa3");
    assert_eq!(db.layer(root(2)).unwrap().account(alice, 0).unwrap().as_ref(), b"\xa1");
    assert_eq!(db.layer(root(3)).unwrap().account(bob, 0).unwrap().as_ref(), b"\xb1");

    // Node lookups report where they were satisfied.
    let head = db.layer(root(3)).unwrap();
    let (_, _, loc) =
        head.node(B256::ZERO, &account_path("alice"), keccak256(b"\xa3"), 0).unwrap();
    assert_eq!(loc.location, NodeLocation::DiffLayer);
    assert_eq!(loc.depth, 0);
    let (_, _, loc) = head.node(B256::ZERO, &account_path("bob"), keccak256(b"\xb1"), 0).unwrap();
    assert_eq!(loc.location, NodeLocation::DiffLayer);
    assert_eq!(loc.depth, 1);
}

#[test]
fn disk_reads_fill_the_clean_cache() {
    let kv = Arc::new(MemoryStore::new());
    let freezer = Arc::new(MemoryAncientStore::new());
    {
        let db = open(&kv, &freezer, Config::default().with_sync_flush(true));
        let (nodes, states) = delta(&[("alice", None, Some(b"\xa1"))]);
        db.update(root(1), B256::ZERO, 1, nodes, states).unwrap();
        db.commit(root(1)).unwrap();
    }

    // Reopen over the same backends: the fresh clean cache is cold, so the
    // first hit comes from disk and the second from the cache.
    let db = Database::new(kv, Some(freezer as _), root(1), Config::default()).unwrap();
    let disk = db.layer(root(1)).unwrap();
    assert_eq!(disk.state_id(), 1);

    let want = keccak256(b"\xa1");
    let (blob, hash, loc) = disk.node(B256::ZERO, &account_path("alice"), want, 0).unwrap();
    assert_eq!(blob.as_ref(), b"\xa1");
    assert_eq!(hash, want);
    assert_eq!(loc.location, NodeLocation::DiskStore);

    let (_, _, loc) = disk.node(B256::ZERO, &account_path("alice"), want, 0).unwrap();
    assert_eq!(loc.location, NodeLocation::CleanCache);
    db.close();
}

#[test]
fn stale_handles_fail_after_commit() {
    let kv = Arc::new(MemoryStore::new());
    let freezer = Arc::new(MemoryAncientStore::new());
    let db = open(&kv, &freezer, Config::default().with_sync_flush(true));

    let genesis = db.layer(B256::ZERO).unwrap();
    let (nodes, states) = delta(&[("alice", None, Some(b"\xa1"))]);
    db.update(root(1), B256::ZERO, 1, nodes, states).unwrap();
    db.commit(root(1)).unwrap();

    // The pre-commit handle went stale; the caller retries with the live
    // root.
    let err = genesis.account(account_hash("alice"), 0).unwrap_err();
    assert_eq!(err, PathdbError::SnapshotStale);
    let err = genesis
        .node(B256::ZERO, &account_path("alice"), keccak256(b"\xa1"), 0)
        .unwrap_err();
    assert_eq!(err, PathdbError::SnapshotStale);
}

#[test]
fn revert_restores_buffered_state() {
    let kv = Arc::new(MemoryStore::new());
    let freezer = Arc::new(MemoryAncientStore::new());
    let config = Config::default().with_sync_flush(true).with_max_diff_layers(1);
    let db = open(&kv, &freezer, config);

    let (nodes, states) = delta(&[("alice", None, Some(b"\xa1"))]);
    db.update(root(1), B256::ZERO, 1, nodes, states).unwrap();
    let (nodes, states) = delta(&[("alice", Some(b"\xa1"), Some(b"\xa2"))]);
    db.update(root(2), root(1), 2, nodes, states).unwrap();

    // R1 was flattened into the buffer but never flushed.
    let (_, buffered) = db.size();
    assert!(buffered > 0);
    assert_eq!(schema::read_persistent_state_id(&kv).unwrap(), 0);

    db.recover(B256::ZERO, &HashRewinder).unwrap();

    // The buffered transition was unwound in memory; disk was never
    // touched and the in-memory diffs are gone.
    assert_eq!(schema::read_persistent_state_id(&kv).unwrap(), 0);
    assert_eq!(db.layer(B256::ZERO).unwrap().state_id(), 0);
    assert!(db.layer(root(1)).is_none());
    assert!(db.layer(root(2)).is_none());
    let (_, buffered) = db.size();
    assert_eq!(buffered, 0);
    assert_eq!(freezer.head().unwrap(), 0);
}

#[test]
fn async_flush_completes_on_close() {
    let kv = Arc::new(MemoryStore::new());
    let freezer = Arc::new(MemoryAncientStore::new());
    let db = open(&kv, &freezer, Config::default());

    let (nodes, states) = delta(&[("alice", None, Some(b"\xa1"))]);
    db.update(root(1), B256::ZERO, 1, nodes, states).unwrap();
    db.commit(root(1)).unwrap();
    db.close();

    assert_eq!(schema::read_persistent_state_id(&kv).unwrap(), 1);
    let mut key = b"A".to_vec();
    key.extend_from_slice(account_path("alice").as_slice());
    assert_eq!(kv.get(&key).unwrap(), Some(b"\xa1".to_vec()));
}

#[test]
fn unknown_states_are_not_recoverable() {
    let kv = Arc::new(MemoryStore::new());
    let freezer = Arc::new(MemoryAncientStore::new());
    let db = open(&kv, &freezer, Config::default().with_sync_flush(true));

    assert!(!db.recoverable(root(9)));
    let err = db.recover(root(9), &HashRewinder).unwrap_err();
    assert_eq!(err, PathdbError::StateUnrecoverable);

    // The live root is not "recoverable" either, it is simply current.
    let (nodes, states) = delta(&[("alice", None, Some(b"\xa1"))]);
    db.update(root(1), B256::ZERO, 1, nodes, states).unwrap();
    db.commit(root(1)).unwrap();
    assert!(!db.recoverable(root(1)));
}

#[test]
fn recovery_without_a_freezer_is_refused() {
    let kv = Arc::new(MemoryStore::new());
    let db =
        Database::new(kv, None, B256::ZERO, Config::default().with_sync_flush(true)).unwrap();

    let (nodes, states) = delta(&[("alice", None, Some(b"\xa1"))]);
    db.update(root(1), B256::ZERO, 1, nodes, states).unwrap();
    db.commit(root(1)).unwrap();

    assert!(!db.recoverable(B256::ZERO));
    let err = db.recover(B256::ZERO, &HashRewinder).unwrap_err();
    assert_eq!(err, PathdbError::StateUnrecoverable);
}
