use alloy_primitives::{Address, B256};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use lamina_storage_api::{StorageResult, Trie, TrieOpener};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    mem,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread,
};
use tracing::warn;

/// Pending-task count above which a subfetcher gets parallel children.
pub(crate) const PARALLEL_PREFETCH_THRESHOLD: u32 = 10;
/// Task slots fed to one parallel child at a time.
pub(crate) const PARALLEL_PREFETCH_CAPACITY: u32 = 20;

/// Telemetry of one subfetcher, published by its worker on exit and
/// finalized by the prefetcher on close.
#[derive(Debug, Default)]
pub(crate) struct SubStats {
    /// Keys loaded through the trie.
    pub(crate) seen: HashSet<Vec<u8>>,
    /// Scheduled keys that had already been loaded.
    pub(crate) dups: u64,
    /// Keys the consumer reported as actually used.
    pub(crate) used: Vec<Vec<u8>>,
}

struct SubfetcherInner {
    state: B256,
    owner: B256,
    root: B256,
    addr: Address,

    tasks: Mutex<Vec<Vec<u8>>>,
    pending: AtomicU32,
    stopped: AtomicBool,

    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    copy_tx: Sender<Sender<Option<Box<dyn Trie>>>>,
    copy_rx: Receiver<Sender<Option<Box<dyn Trie>>>>,
    // Closed (disconnected) once the worker has exited.
    term_rx: Receiver<()>,

    // Worker state handed back at termination so late peeks still succeed.
    parked: Mutex<Option<Box<dyn Trie>>>,
    stats: Mutex<SubStats>,

    children: Mutex<Vec<Subfetcher>>,
}

/// A background worker pulling entries for a single trie.
///
/// Spawned when a new trie id is encountered; lives until the prefetcher
/// closes or the trie is claimed by the consumer.
#[derive(Clone)]
pub(crate) struct Subfetcher {
    inner: Arc<SubfetcherInner>,
}

impl Subfetcher {
    pub(crate) fn new(
        db: Arc<dyn TrieOpener>,
        state: B256,
        owner: B256,
        root: B256,
        addr: Address,
    ) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded(1);
        let (copy_tx, copy_rx) = bounded(0);
        let (term_tx, term_rx) = bounded::<()>(0);
        let inner = Arc::new(SubfetcherInner {
            state,
            owner,
            root,
            addr,
            tasks: Mutex::new(Vec::new()),
            pending: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            wake_tx,
            wake_rx,
            stop_tx,
            stop_rx,
            copy_tx,
            copy_rx,
            term_rx,
            parked: Mutex::new(None),
            stats: Mutex::new(SubStats::default()),
            children: Mutex::new(Vec::new()),
        });
        let worker = inner.clone();
        let spawned = thread::Builder::new()
            .name("lamina-prefetch-worker".into())
            .spawn(move || run(worker, db, term_tx));
        if let Err(err) = spawned {
            warn!(target: "prefetch", %err, "Failed to spawn prefetch worker");
            inner.stopped.store(true, Ordering::Release);
        }
        Self { inner }
    }

    /// Queues a batch of trie keys for retrieval and wakes the worker.
    pub(crate) fn schedule(&self, keys: Vec<Vec<u8>>) {
        self.inner.pending.fetch_add(keys.len() as u32, Ordering::AcqRel);
        self.inner.tasks.lock().extend(keys);
        // Fine if the worker is already signaled or gone.
        let _ = self.inner.wake_tx.try_send(());
    }

    /// Distributes `keys` over parallel children, spawning new ones up to
    /// `⌈left / capacity⌉` once the existing children are saturated. The
    /// start child rotates so the first one is not always fed first.
    pub(crate) fn schedule_parallel(&self, db: &Arc<dyn TrieOpener>, keys: &[Vec<u8>]) {
        let mut children = self.inner.children.lock();
        let mut key_index = 0usize;
        if !children.is_empty() {
            let mut child_index = keys.len() % children.len();
            for _ in 0..children.len() {
                let child = children[child_index].clone();
                child_index = (child_index + 1) % children.len();
                let backlog = child.pending();
                if backlog >= PARALLEL_PREFETCH_CAPACITY {
                    continue;
                }
                let feed = (PARALLEL_PREFETCH_CAPACITY - backlog) as usize;
                if key_index + feed >= keys.len() {
                    child.schedule(keys[key_index..].to_vec());
                    return;
                }
                child.schedule(keys[key_index..key_index + feed].to_vec());
                key_index += feed;
            }
        }
        // The children did not absorb everything; spawn workers for the rest.
        let left = &keys[key_index..];
        let capacity = PARALLEL_PREFETCH_CAPACITY as usize;
        let mut chunk = 0usize;
        while chunk * capacity < left.len() {
            let child = Self::new(
                db.clone(),
                self.inner.state,
                self.inner.owner,
                self.inner.root,
                self.inner.addr,
            );
            let end = (chunk + 1) * capacity;
            if end >= left.len() {
                child.schedule(left[chunk * capacity..].to_vec());
                children.push(child);
                return;
            }
            child.schedule(left[chunk * capacity..end].to_vec());
            children.push(child);
            chunk += 1;
        }
    }

    /// Retrieves a deep copy of the trie in whatever shape it currently is:
    /// from the live worker if it still runs, from the parked trie if it
    /// terminated.
    pub(crate) fn peek(&self) -> Option<Box<dyn Trie>> {
        let (reply_tx, reply_rx) = bounded(1);
        select! {
            send(self.inner.copy_tx, reply_tx) -> res => {
                if res.is_err() {
                    return self.parked_copy();
                }
                reply_rx.recv().ok().flatten()
            }
            recv(self.inner.term_rx) -> _ => self.parked_copy(),
        }
    }

    fn parked_copy(&self) -> Option<Box<dyn Trie>> {
        self.inner.parked.lock().as_ref().map(|trie| trie.copied())
    }

    /// Interrupts the worker. Safe to call any number of times.
    pub(crate) fn abort(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            let _ = self.inner.stop_tx.try_send(());
        }
    }

    /// Blocks until the worker has exited.
    pub(crate) fn wait_term(&self) {
        let _ = self.inner.term_rx.recv();
    }

    pub(crate) fn pending(&self) -> u32 {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn root(&self) -> B256 {
        self.inner.root
    }

    pub(crate) fn children(&self) -> Vec<Subfetcher> {
        self.inner.children.lock().clone()
    }

    /// Records keys the consumer ended up using.
    pub(crate) fn mark_used(&self, keys: impl IntoIterator<Item = Vec<u8>>) {
        self.inner.stats.lock().used.extend(keys);
    }

    /// Folds the worker telemetry into `(loaded, dups, skipped, wasted)`.
    /// Must only run after termination; consumes the used set.
    pub(crate) fn accounting(&self) -> (u64, u64, u64, u64) {
        let mut stats = self.inner.stats.lock();
        let loaded = stats.seen.len() as u64;
        let dups = stats.dups;
        let skipped = self.inner.tasks.lock().len() as u64;
        let used = mem::take(&mut stats.used);
        for key in &used {
            stats.seen.remove(key);
        }
        let wasted = stats.seen.len() as u64;
        (loaded, dups, skipped, wasted)
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> (usize, u64, usize) {
        let stats = self.inner.stats.lock();
        (stats.seen.len(), stats.dups, stats.used.len())
    }
}

impl core::fmt::Debug for Subfetcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subfetcher")
            .field("owner", &self.inner.owner)
            .field("root", &self.inner.root)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

fn open_trie(db: &Arc<dyn TrieOpener>, inner: &SubfetcherInner) -> StorageResult<Box<dyn Trie>> {
    if inner.owner.is_zero() {
        db.open_trie(inner.state)
    } else {
        db.open_storage_trie(inner.state, inner.addr, inner.root)
    }
}

/// Worker loop: wait for a wake signal, drain the task queue, load every
/// unseen key through the trie, and service copy requests in between. Any
/// interruption parks the trie and publishes the telemetry.
fn run(inner: Arc<SubfetcherInner>, db: Arc<dyn TrieOpener>, term_tx: Sender<()>) {
    // Dropped on every exit path, closing the term channel.
    let _term = term_tx;

    let mut trie = match open_trie(&db, &inner) {
        Ok(trie) => trie,
        Err(err) => {
            warn!(
                target: "prefetch",
                owner = %inner.owner,
                root = %inner.root,
                %err,
                "Prefetch worker failed opening trie"
            );
            return;
        }
    };
    let mut seen: HashSet<Vec<u8>> = HashSet::new();
    let mut dups = 0u64;

    'outer: loop {
        select! {
            recv(inner.wake_rx) -> msg => {
                if msg.is_err() {
                    break 'outer;
                }
                let tasks = mem::take(&mut *inner.tasks.lock());
                for (index, task) in tasks.iter().enumerate() {
                    if inner.stopped.load(Ordering::Acquire) {
                        // Put the leftovers back; close() counts them as
                        // skipped work.
                        inner.tasks.lock().extend_from_slice(&tasks[index..]);
                        break 'outer;
                    }
                    // Somebody may be waiting on a snapshot mid-drain.
                    if let Ok(reply) = inner.copy_rx.try_recv() {
                        let _ = reply.send(Some(trie.copied()));
                    }
                    if seen.contains(task) {
                        dups += 1;
                    } else {
                        if task.len() == Address::len_bytes() {
                            let _ = trie.get_account(Address::from_slice(task));
                        } else {
                            let _ = trie.get_storage(inner.addr, task);
                        }
                        seen.insert(task.clone());
                    }
                    inner.pending.fetch_sub(1, Ordering::AcqRel);
                }
            }
            recv(inner.copy_rx) -> reply => {
                if let Ok(reply) = reply {
                    let _ = reply.send(Some(trie.copied()));
                }
            }
            recv(inner.stop_rx) -> _ => {
                break 'outer;
            }
        }
    }

    *inner.parked.lock() = Some(trie);
    let mut stats = inner.stats.lock();
    stats.seen = seen;
    stats.dups = dups;
}
