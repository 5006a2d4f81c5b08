use crate::StorageResult;

/// An append-only item log ("freezer") with independently movable ends.
///
/// Items are addressed by dense ids. `head` is the id the next append will
/// receive, `tail` the lowest retained id; the retained range is
/// `[tail, head)`. Appends must be contiguous: `append(id, ..)` fails unless
/// `id == head`.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait AncientStore: Send + Sync + core::fmt::Debug {
    /// Appends `blob` as item `id`.
    fn append(&self, id: u64, blob: &[u8]) -> StorageResult<()>;

    /// Reads back item `id`.
    fn read(&self, id: u64) -> StorageResult<Vec<u8>>;

    /// Returns the id the next append will receive.
    fn head(&self) -> StorageResult<u64>;

    /// Returns the lowest retained item id.
    fn tail(&self) -> StorageResult<u64>;

    /// Drops all items with id `>= items`, returning the number removed.
    fn truncate_head(&self, items: u64) -> StorageResult<u64>;

    /// Drops all items with id `< items`, returning the number removed.
    fn truncate_tail(&self, items: u64) -> StorageResult<u64>;

    /// Blocks until previously appended items are durable.
    fn sync(&self) -> StorageResult<()>;
}
