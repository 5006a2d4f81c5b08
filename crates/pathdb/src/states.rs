use alloy_primitives::{map::B256Map, Bytes, B256};

/// Flat post-state of one or more transitions: account blobs keyed by the
/// hash of the account address, storage slots keyed by account and slot
/// hash. An empty blob marks a deletion.
#[derive(Clone, Debug, Default)]
pub struct StateSet {
    accounts: B256Map<Bytes>,
    storages: B256Map<B256Map<Bytes>>,
    size: u64,
}

impl StateSet {
    /// Creates a set from flat account and storage data.
    pub fn new(accounts: B256Map<Bytes>, storages: B256Map<B256Map<Bytes>>) -> Self {
        let mut size = 0u64;
        for (_, blob) in accounts.iter() {
            size += account_entry_size(blob);
        }
        for (_, slots) in storages.iter() {
            for (_, blob) in slots.iter() {
                size += slot_entry_size(blob);
            }
        }
        Self { accounts, storages, size }
    }

    /// Returns the account blob for `hash`. `Some` with an empty blob means
    /// the account was deleted in this transition.
    pub fn account(&self, hash: &B256) -> Option<&Bytes> {
        self.accounts.get(hash)
    }

    /// Returns the storage slot `slot_hash` of the account `account_hash`.
    pub fn storage(&self, account_hash: &B256, slot_hash: &B256) -> Option<&Bytes> {
        self.storages.get(account_hash)?.get(slot_hash)
    }

    /// Returns the approximate content size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns whether the set holds no state.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.storages.is_empty()
    }

    /// Merges `other` on top of this set; entries in `other` win.
    pub fn merge(&mut self, other: &Self) {
        let mut delta = 0i64;
        for (hash, blob) in other.accounts.iter() {
            if let Some(replaced) = self.accounts.insert(*hash, blob.clone()) {
                delta += blob.len() as i64 - replaced.len() as i64;
            } else {
                delta += account_entry_size(blob) as i64;
            }
        }
        for (account, slots) in other.storages.iter() {
            let current = self.storages.entry(*account).or_default();
            for (slot, blob) in slots.iter() {
                if let Some(replaced) = current.insert(*slot, blob.clone()) {
                    delta += blob.len() as i64 - replaced.len() as i64;
                } else {
                    delta += slot_entry_size(blob) as i64;
                }
            }
        }
        self.update_size(delta);
    }

    /// Replaces entries with the pre-images of the most recent transition.
    /// An empty pre-image means the entry did not exist before and is
    /// dropped from the set.
    pub fn revert_to(&mut self, accounts: &B256Map<Bytes>, storages: &B256Map<B256Map<Bytes>>) {
        let mut delta = 0i64;
        for (hash, prev) in accounts.iter() {
            if prev.is_empty() {
                if let Some(removed) = self.accounts.remove(hash) {
                    delta -= account_entry_size(&removed) as i64;
                }
            } else if let Some(replaced) = self.accounts.insert(*hash, prev.clone()) {
                delta += prev.len() as i64 - replaced.len() as i64;
            } else {
                delta += account_entry_size(prev) as i64;
            }
        }
        for (account, slots) in storages.iter() {
            let current = self.storages.entry(*account).or_default();
            for (slot, prev) in slots.iter() {
                if prev.is_empty() {
                    if let Some(removed) = current.remove(slot) {
                        delta -= slot_entry_size(&removed) as i64;
                    }
                } else if let Some(replaced) = current.insert(*slot, prev.clone()) {
                    delta += prev.len() as i64 - replaced.len() as i64;
                } else {
                    delta += slot_entry_size(prev) as i64;
                }
            }
        }
        self.update_size(delta);
    }

    /// Clears the set.
    pub fn reset(&mut self) {
        self.accounts.clear();
        self.storages.clear();
        self.size = 0;
    }

    fn update_size(&mut self, delta: i64) {
        self.size = self.size.saturating_add_signed(delta);
    }
}

fn account_entry_size(blob: &Bytes) -> u64 {
    (B256::len_bytes() + blob.len()) as u64
}

fn slot_entry_size(blob: &Bytes) -> u64 {
    (2 * B256::len_bytes() + blob.len()) as u64
}

/// A [`StateSet`] extended with the pre-images of everything it modified.
///
/// The origin maps are keyed like the post-state; a key is present iff the
/// transition touched it, and an empty blob records that the entry did not
/// exist before. History construction is their only consumer.
#[derive(Clone, Debug, Default)]
pub struct StateSetWithOrigin {
    state: StateSet,
    account_origin: B256Map<Bytes>,
    storage_origin: B256Map<B256Map<Bytes>>,
}

impl StateSetWithOrigin {
    /// Creates a set from post-state data and pre-images.
    pub fn new(
        state: StateSet,
        account_origin: B256Map<Bytes>,
        storage_origin: B256Map<B256Map<Bytes>>,
    ) -> Self {
        Self { state, account_origin, storage_origin }
    }

    /// Returns the post-state data.
    pub fn state(&self) -> &StateSet {
        &self.state
    }

    /// Returns the account pre-images.
    pub fn account_origin(&self) -> &B256Map<Bytes> {
        &self.account_origin
    }

    /// Returns the storage pre-images.
    pub fn storage_origin(&self) -> &B256Map<B256Map<Bytes>> {
        &self.storage_origin
    }

    /// Returns the approximate memory footprint, post-state and origins.
    pub fn size(&self) -> u64 {
        let mut size = self.state.size();
        for (_, blob) in self.account_origin.iter() {
            size += account_entry_size(blob);
        }
        for (_, slots) in self.storage_origin.iter() {
            for (_, blob) in slots.iter() {
                size += slot_entry_size(blob);
            }
        }
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::b256;

    const A: B256 = b256!("00000000000000000000000000000000000000000000000000000000000000a1");
    const B: B256 = b256!("00000000000000000000000000000000000000000000000000000000000000b2");

    fn accounts(entries: &[(B256, &[u8])]) -> B256Map<Bytes> {
        let mut map = B256Map::default();
        for (hash, blob) in entries {
            map.insert(*hash, Bytes::copy_from_slice(blob));
        }
        map
    }

    #[test]
    fn merge_overwrites_with_newer() {
        let mut set = StateSet::new(accounts(&[(A, b"v1")]), B256Map::default());
        let newer = StateSet::new(accounts(&[(A, b"v2-long"), (B, b"w")]), B256Map::default());
        set.merge(&newer);

        assert_eq!(set.account(&A).unwrap().as_ref(), b"v2-long");
        assert_eq!(set.account(&B).unwrap().as_ref(), b"w");
        // (32 + 7) + (32 + 1)
        assert_eq!(set.size(), 72);
    }

    #[test]
    fn revert_drops_created_entries() {
        let mut set = StateSet::new(accounts(&[(A, b"created")]), B256Map::default());
        // Pre-image is empty: the account did not exist before.
        set.revert_to(&accounts(&[(A, b"")]), &B256Map::default());

        assert!(set.account(&A).is_none());
        assert_eq!(set.size(), 0);
    }

    #[test]
    fn revert_restores_previous_storage() {
        let mut slots = B256Map::default();
        slots.insert(B, Bytes::copy_from_slice(b"post"));
        let mut storages = B256Map::default();
        storages.insert(A, slots);
        let mut set = StateSet::new(B256Map::default(), storages);

        let mut prev_slots = B256Map::default();
        prev_slots.insert(B, Bytes::copy_from_slice(b"pre"));
        let mut prev = B256Map::default();
        prev.insert(A, prev_slots);
        set.revert_to(&B256Map::default(), &prev);

        assert_eq!(set.storage(&A, &B).unwrap().as_ref(), b"pre");
    }
}
