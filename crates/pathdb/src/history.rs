use crate::{diff::DiffLayer, schema, PathdbError};
use alloy_primitives::{map::B256Map, Bytes, B256};
use bytes::{Buf, BufMut};
use lamina_storage_api::{AncientStore, KeyValueStore, WriteBatch};
use tracing::debug;

/// Initial state-history encoding.
pub const HISTORY_VERSION_V0: u8 = 0;
/// Current state-history encoding.
pub const HISTORY_VERSION: u8 = 1;

/// Header of a state-history record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryMeta {
    /// Encoding version of the record.
    pub version: u8,
    /// State root before the transition.
    pub parent_root: B256,
    /// State root after the transition.
    pub root: B256,
}

/// One state transition's reverse patch: the pre-image of every account and
/// storage slot the transition modified.
///
/// Records are addressed by their state id; adjacent records chain through
/// `meta`: `record[id].parent_root == record[id - 1].root`. An empty
/// pre-image records that the entry did not exist before the transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct History {
    /// Record header.
    pub meta: HistoryMeta,
    /// Account pre-images, sorted by address hash.
    pub accounts: Vec<(B256, Bytes)>,
    /// Storage pre-images, sorted by address hash, slots sorted within.
    pub storages: Vec<(B256, Vec<(B256, Bytes)>)>,
}

impl History {
    /// Builds the record describing the transition of `bottom`.
    pub fn from_diff(bottom: &DiffLayer) -> Self {
        let origin = bottom.states();

        let mut accounts: Vec<(B256, Bytes)> = origin
            .account_origin()
            .iter()
            .map(|(hash, blob)| (*hash, blob.clone()))
            .collect();
        accounts.sort_unstable_by_key(|(hash, _)| *hash);

        let mut storages: Vec<(B256, Vec<(B256, Bytes)>)> = origin
            .storage_origin()
            .iter()
            .map(|(hash, slots)| {
                let mut slots: Vec<(B256, Bytes)> =
                    slots.iter().map(|(slot, blob)| (*slot, blob.clone())).collect();
                slots.sort_unstable_by_key(|(slot, _)| *slot);
                (*hash, slots)
            })
            .collect();
        storages.sort_unstable_by_key(|(hash, _)| *hash);

        Self {
            meta: HistoryMeta {
                version: HISTORY_VERSION,
                parent_root: bottom.parent().root(),
                root: bottom.root(),
            },
            accounts,
            storages,
        }
    }

    /// Serializes the record as
    ///
    /// ```text
    /// version | parentRoot | root
    ///         | accountCount {addrHash blobLen blob}*
    ///         | storageAccountCount {addrHash slotCount {slotHash blobLen blob}*}*
    /// ```
    ///
    /// with all counts and lengths as LEB128 varints.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(65 + self.accounts.len() * 64);
        out.put_u8(self.meta.version);
        out.put_slice(self.meta.parent_root.as_slice());
        out.put_slice(self.meta.root.as_slice());

        put_uvarint(&mut out, self.accounts.len() as u64);
        for (hash, blob) in &self.accounts {
            out.put_slice(hash.as_slice());
            put_uvarint(&mut out, blob.len() as u64);
            out.put_slice(blob);
        }
        put_uvarint(&mut out, self.storages.len() as u64);
        for (hash, slots) in &self.storages {
            out.put_slice(hash.as_slice());
            put_uvarint(&mut out, slots.len() as u64);
            for (slot, blob) in slots {
                out.put_slice(slot.as_slice());
                put_uvarint(&mut out, blob.len() as u64);
                out.put_slice(blob);
            }
        }
        out
    }

    /// Deserializes a record, validating version and framing.
    pub fn decode(blob: &[u8]) -> Result<Self, PathdbError> {
        let mut buf = blob;
        if buf.remaining() < 1 + 2 * B256::len_bytes() {
            return Err(PathdbError::Decode("truncated header"));
        }
        let version = buf.get_u8();
        if version != HISTORY_VERSION_V0 && version != HISTORY_VERSION {
            return Err(PathdbError::Decode("unknown version"));
        }
        let parent_root = take_hash(&mut buf)?;
        let root = take_hash(&mut buf)?;

        let account_count = read_uvarint(&mut buf)?;
        let mut accounts = Vec::with_capacity(account_count.min(1024) as usize);
        for _ in 0..account_count {
            let hash = take_hash(&mut buf)?;
            let blob = take_blob(&mut buf)?;
            accounts.push((hash, blob));
        }
        let storage_count = read_uvarint(&mut buf)?;
        let mut storages = Vec::with_capacity(storage_count.min(1024) as usize);
        for _ in 0..storage_count {
            let hash = take_hash(&mut buf)?;
            let slot_count = read_uvarint(&mut buf)?;
            let mut slots = Vec::with_capacity(slot_count.min(1024) as usize);
            for _ in 0..slot_count {
                let slot = take_hash(&mut buf)?;
                let blob = take_blob(&mut buf)?;
                slots.push((slot, blob));
            }
            storages.push((hash, slots));
        }
        if buf.has_remaining() {
            return Err(PathdbError::Decode("trailing bytes"));
        }
        Ok(Self { meta: HistoryMeta { version, parent_root, root }, accounts, storages })
    }

    /// Returns the pre-images as flat maps keyed like the live state sets.
    pub fn state_set(&self) -> (B256Map<Bytes>, B256Map<B256Map<Bytes>>) {
        let mut accounts = B256Map::default();
        for (hash, blob) in &self.accounts {
            accounts.insert(*hash, blob.clone());
        }
        let mut storages = B256Map::default();
        for (hash, slots) in &self.storages {
            let entry: &mut B256Map<Bytes> = storages.entry(*hash).or_default();
            for (slot, blob) in slots {
                entry.insert(*slot, blob.clone());
            }
        }
        (accounts, storages)
    }
}

fn take_hash(buf: &mut &[u8]) -> Result<B256, PathdbError> {
    if buf.remaining() < B256::len_bytes() {
        return Err(PathdbError::Decode("truncated hash"));
    }
    let hash = B256::from_slice(&buf[..B256::len_bytes()]);
    buf.advance(B256::len_bytes());
    Ok(hash)
}

fn take_blob(buf: &mut &[u8]) -> Result<Bytes, PathdbError> {
    let len = read_uvarint(buf)? as usize;
    if buf.remaining() < len {
        return Err(PathdbError::Decode("truncated blob"));
    }
    let blob = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(blob)
}

fn put_uvarint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    out.put_u8(value as u8);
}

fn read_uvarint(buf: &mut &[u8]) -> Result<u64, PathdbError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(PathdbError::Decode("truncated varint"));
        }
        let byte = buf.get_u8();
        if shift == 63 && byte > 1 {
            return Err(PathdbError::Decode("varint overflow"));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(PathdbError::Decode("varint overflow"));
        }
    }
}

// History id `n` describes the transition onto state id `n`; since histories
// start at state id 1, record `n` lives at freezer index `n - 1`.

/// Returns the id of the most recent stored history, zero if none.
pub(crate) fn head_id(freezer: &dyn AncientStore) -> Result<u64, PathdbError> {
    Ok(freezer.head()?)
}

/// Returns the id of the oldest stored history, zero if the log is empty.
pub(crate) fn tail_id(freezer: &dyn AncientStore) -> Result<u64, PathdbError> {
    let head = freezer.head()?;
    let tail = freezer.tail()?;
    if head == tail {
        return Ok(0);
    }
    Ok(tail + 1)
}

/// Constructs and appends the history record of `bottom`.
pub(crate) fn write_history(
    freezer: &dyn AncientStore,
    bottom: &DiffLayer,
) -> Result<(), PathdbError> {
    let history = History::from_diff(bottom);
    freezer.append(bottom.state_id() - 1, &history.encode())?;
    Ok(())
}

/// Reads the history record of state id `id`.
pub(crate) fn read_history(freezer: &dyn AncientStore, id: u64) -> Result<History, PathdbError> {
    if id == 0 {
        return Err(PathdbError::StateUnrecoverable);
    }
    History::decode(&freezer.read(id - 1)?)
}

/// Drops all histories with id beyond `id`, unmapping their roots. Driven by
/// crash recovery when the log runs ahead of the persisted state.
pub(crate) fn truncate_from_head(
    db: &dyn KeyValueStore,
    freezer: &dyn AncientStore,
    id: u64,
) -> Result<u64, PathdbError> {
    let head = head_id(freezer)?;
    if head <= id {
        return Ok(0);
    }
    let mut batch = WriteBatch::new();
    for stale in id + 1..=head {
        let history = read_history(freezer, stale)?;
        schema::delete_state_id(&mut batch, &history.meta.root);
    }
    db.write_batch(batch)?;
    let removed = freezer.truncate_head(id)?;
    debug!(target: "pathdb", removed, head = id, "Truncated state history from head");
    Ok(removed)
}

/// Drops all histories with id up to and including `id`, unmapping their
/// roots. Driven by the configured retention limit.
pub(crate) fn truncate_from_tail(
    db: &dyn KeyValueStore,
    freezer: &dyn AncientStore,
    id: u64,
) -> Result<u64, PathdbError> {
    let tail = tail_id(freezer)?;
    if tail > id {
        return Ok(0);
    }
    let mut batch = WriteBatch::new();
    for stale in tail.max(1)..=id {
        let history = read_history(freezer, stale)?;
        schema::delete_state_id(&mut batch, &history.meta.root);
    }
    db.write_batch(batch)?;
    let removed = freezer.truncate_tail(id)?;
    debug!(target: "pathdb", removed, tail = id + 1, "Truncated state history from tail");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::b256;
    use lamina_storage_api::MemoryAncientStore;

    const PARENT: B256 = b256!("1111111111111111111111111111111111111111111111111111111111111111");
    const ROOT: B256 = b256!("2222222222222222222222222222222222222222222222222222222222222222");
    const ADDR: B256 = b256!("00000000000000000000000000000000000000000000000000000000000000aa");
    const SLOT: B256 = b256!("00000000000000000000000000000000000000000000000000000000000000bb");

    fn sample() -> History {
        History {
            meta: HistoryMeta { version: HISTORY_VERSION, parent_root: PARENT, root: ROOT },
            accounts: vec![(ADDR, Bytes::from_static(b"pre"))],
            storages: vec![(ADDR, vec![(SLOT, Bytes::new())])],
        }
    }

    #[test]
    fn encoding_layout_is_stable() {
        let encoded = sample().encode();

        // version ‖ parentRoot ‖ root
        assert_eq!(encoded[0], HISTORY_VERSION);
        assert_eq!(&encoded[1..33], PARENT.as_slice());
        assert_eq!(&encoded[33..65], ROOT.as_slice());
        // accountCount=1 ‖ addrHash ‖ blobLen=3 ‖ "pre"
        assert_eq!(encoded[65], 1);
        assert_eq!(&encoded[66..98], ADDR.as_slice());
        assert_eq!(encoded[98], 3);
        assert_eq!(&encoded[99..102], b"pre");
        // storageAccountCount=1 ‖ addrHash ‖ slotCount=1 ‖ slotHash ‖ blobLen=0
        assert_eq!(encoded[102], 1);
        assert_eq!(&encoded[103..135], ADDR.as_slice());
        assert_eq!(encoded[135], 1);
        assert_eq!(&encoded[136..168], SLOT.as_slice());
        assert_eq!(encoded[168], 0);
        assert_eq!(encoded.len(), 169);

        assert_eq!(History::decode(&encoded).unwrap(), sample());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(History::decode(b"short"), Err(PathdbError::Decode(_))));

        let mut bad_version = sample().encode();
        bad_version[0] = 9;
        assert!(matches!(History::decode(&bad_version), Err(PathdbError::Decode(_))));

        let mut trailing = sample().encode();
        trailing.push(0);
        assert!(matches!(History::decode(&trailing), Err(PathdbError::Decode(_))));
    }

    #[test]
    fn varints_encode_multi_byte_lengths() {
        let mut history = sample();
        history.accounts[0].1 = Bytes::from(vec![0x5a; 300]);
        let encoded = history.encode();
        // 300 = 0xAC ‖ 0x02 in LEB128
        assert_eq!(&encoded[98..100], &[0xac, 0x02]);
        assert_eq!(History::decode(&encoded).unwrap(), history);
    }

    #[test]
    fn ids_offset_against_freezer_indexes() {
        let freezer = MemoryAncientStore::new();
        assert_eq!(head_id(&freezer).unwrap(), 0);
        assert_eq!(tail_id(&freezer).unwrap(), 0);

        freezer.append(0, &sample().encode()).unwrap();
        assert_eq!(head_id(&freezer).unwrap(), 1);
        assert_eq!(tail_id(&freezer).unwrap(), 1);
        assert_eq!(read_history(&freezer, 1).unwrap(), sample());
        assert!(matches!(read_history(&freezer, 0), Err(PathdbError::StateUnrecoverable)));
    }
}
