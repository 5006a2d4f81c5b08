use crate::subfetcher::{Subfetcher, PARALLEL_PREFETCH_THRESHOLD};
use alloy_primitives::{Address, B256};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use lamina_storage_api::{Trie, TrieOpener};
use metrics::{counter, Counter};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};
use tracing::{error, trace};

const ABORT_CHAN_SIZE: usize = 64;
const CONCURRENT_CHAN_SIZE: usize = 10;

/// A trie identity: owner hash and trie root. A zero owner denotes the
/// account trie, anything else the storage trie of that account.
type TrieId = (B256, B256);

struct PrefetchMsg {
    owner: B256,
    root: B256,
    addr: Address,
    keys: Vec<Vec<u8>>,
}

#[derive(Clone)]
struct PrefetcherMetrics {
    delivery_miss: Counter,
    account_load: Counter,
    account_dup: Counter,
    account_skip: Counter,
    account_waste: Counter,
    storage_load: Counter,
    storage_dup: Counter,
    storage_skip: Counter,
    storage_waste: Counter,
}

impl PrefetcherMetrics {
    fn new(namespace: &str) -> Self {
        let ns = namespace.to_string();
        Self {
            delivery_miss: counter!("prefetch.deliverymiss", "namespace" => ns.clone()),
            account_load: counter!("prefetch.account.load", "namespace" => ns.clone()),
            account_dup: counter!("prefetch.account.dup", "namespace" => ns.clone()),
            account_skip: counter!("prefetch.account.skip", "namespace" => ns.clone()),
            account_waste: counter!("prefetch.account.waste", "namespace" => ns.clone()),
            storage_load: counter!("prefetch.storage.load", "namespace" => ns.clone()),
            storage_dup: counter!("prefetch.storage.dup", "namespace" => ns.clone()),
            storage_skip: counter!("prefetch.storage.skip", "namespace" => ns.clone()),
            storage_waste: counter!("prefetch.storage.waste", "namespace" => ns),
        }
    }
}

enum Mode {
    /// Live prefetcher with a scheduler thread and one worker per trie.
    Active {
        fetchers: Arc<RwLock<HashMap<TrieId, Subfetcher>>>,
        prefetch_tx: Sender<PrefetchMsg>,
        abort_tx: Sender<Subfetcher>,
        close_tx: Sender<()>,
        done_rx: Receiver<()>,
        closed: Arc<AtomicBool>,
    },
    /// Deep copy without workers; answers `trie` from materialized copies
    /// and ignores everything else.
    Inactive { fetches: HashMap<TrieId, Box<dyn Trie>> },
}

/// Receives the accounts and storage slots a block is likely to touch and
/// loads them through the tries, so the node caches are warm before
/// execution asks for them. The prefetcher only fills caches; it never
/// mutates state.
///
/// The API is not thread safe: one prefetcher belongs to one block
/// execution.
pub struct TriePrefetcher {
    db: Arc<dyn TrieOpener>,
    root: B256,
    no_reads: bool,
    metrics: PrefetcherMetrics,
    mode: Mode,
}

impl TriePrefetcher {
    /// Creates an active prefetcher for the state rooted at `root`.
    ///
    /// `no_reads` drops prefetch requests that merely mirror state reads.
    /// The namespace only scopes the telemetry.
    pub fn new(db: Arc<dyn TrieOpener>, root: B256, namespace: &str, no_reads: bool) -> Self {
        let metrics = PrefetcherMetrics::new(namespace);
        let fetchers = Arc::new(RwLock::new(HashMap::new()));
        let (prefetch_tx, prefetch_rx) = bounded(CONCURRENT_CHAN_SIZE);
        let (abort_tx, abort_rx) = bounded(ABORT_CHAN_SIZE);
        let (close_tx, close_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);

        let scheduler = Scheduler {
            db: db.clone(),
            root,
            fetchers: fetchers.clone(),
            prefetch_rx,
            abort_rx,
            close_rx,
            done_tx,
            metrics: metrics.clone(),
        };
        let spawned = thread::Builder::new()
            .name("lamina-prefetch-main".into())
            .spawn(move || scheduler.run());
        if let Err(err) = spawned {
            error!(target: "prefetch", %err, "Failed to spawn prefetch scheduler");
            return Self {
                db,
                root,
                no_reads,
                metrics,
                mode: Mode::Inactive { fetches: HashMap::new() },
            };
        }
        Self {
            db,
            root,
            no_reads,
            metrics,
            mode: Mode::Active {
                fetchers,
                prefetch_tx,
                abort_tx,
                close_tx,
                done_rx,
                closed: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    /// Schedules a batch of account and storage keys on the trie
    /// `(owner, root)`. `read_only` marks requests that merely mirror state
    /// reads; they are dropped when the prefetcher was built with
    /// `no_reads`.
    pub fn prefetch(
        &self,
        owner: B256,
        root: B256,
        addr: Address,
        addrs: &[Address],
        slots: &[B256],
        read_only: bool,
    ) {
        if read_only && self.no_reads {
            return;
        }
        let Mode::Active { prefetch_tx, closed, .. } = &self.mode else { return };
        if closed.load(Ordering::Acquire) {
            return;
        }
        let mut keys = Vec::with_capacity(addrs.len() + slots.len());
        for addr in addrs {
            keys.push(addr.as_slice().to_vec());
        }
        for slot in slots {
            keys.push(slot.as_slice().to_vec());
        }
        // The send blocks while the scheduler is saturated and fails once
        // it has exited; both are fine.
        let _ = prefetch_tx.send(PrefetchMsg { owner, root, addr, keys });
    }

    /// Claims the trie `(owner, root)`, preempting its worker, and returns
    /// a consistent deep copy of everything loaded so far.
    pub fn trie(&self, owner: B256, root: B256) -> Option<Box<dyn Trie>> {
        let id = (owner, root);
        match &self.mode {
            Mode::Inactive { fetches } => fetches.get(&id).map(|trie| trie.copied()),
            Mode::Active { fetchers, abort_tx, closed, .. } => {
                let Some(fetcher) = fetchers.read().get(&id).cloned() else {
                    self.metrics.delivery_miss.increment(1);
                    return None;
                };
                // Interrupt the worker so the snapshot is consistent.
                if !closed.load(Ordering::Acquire) {
                    let _ = abort_tx.send(fetcher.clone());
                }
                let trie = fetcher.peek();
                if trie.is_none() {
                    self.metrics.delivery_miss.increment(1);
                }
                trie
            }
        }
    }

    /// Reports which of the prefetched keys the consumer actually used,
    /// feeding the waste telemetry.
    pub fn used(&self, owner: B256, root: B256, addrs: &[Address], slots: &[B256]) {
        let Mode::Active { fetchers, closed, .. } = &self.mode else { return };
        if closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(fetcher) = fetchers.read().get(&(owner, root)) {
            fetcher.mark_used(
                addrs
                    .iter()
                    .map(|addr| addr.as_slice().to_vec())
                    .chain(slots.iter().map(|slot| slot.as_slice().to_vec())),
            );
        }
    }

    /// Creates a deep-but-inactive copy: every trie loaded so far is
    /// materialized, no workers are running. Used by block producers that
    /// seal a snapshot of actively mutated state.
    pub fn copied(&self) -> TriePrefetcher {
        let fetches = match &self.mode {
            Mode::Inactive { fetches } => {
                fetches.iter().map(|(id, trie)| (*id, trie.copied())).collect()
            }
            Mode::Active { fetchers, closed, .. } => {
                if closed.load(Ordering::Acquire) {
                    HashMap::new()
                } else {
                    let fetchers = fetchers.read();
                    let mut fetches = HashMap::with_capacity(fetchers.len());
                    for (id, fetcher) in fetchers.iter() {
                        if let Some(trie) = fetcher.peek() {
                            fetches.insert(*id, trie);
                        }
                    }
                    fetches
                }
            }
        };
        TriePrefetcher {
            db: self.db.clone(),
            root: self.root,
            no_reads: self.no_reads,
            metrics: self.metrics.clone(),
            mode: Mode::Inactive { fetches },
        }
    }

    /// Terminates every worker, waits for them, and publishes the load /
    /// dup / skip / waste telemetry. Idempotent.
    pub fn close(&self) {
        let Mode::Active { close_tx, done_rx, closed, .. } = &self.mode else { return };
        if !closed.swap(true, Ordering::AcqRel) {
            let _ = close_tx.send(());
            let _ = done_rx.recv();
        }
    }

    #[cfg(test)]
    pub(crate) fn fetcher(&self, owner: B256, root: B256) -> Option<Subfetcher> {
        match &self.mode {
            Mode::Active { fetchers, .. } => fetchers.read().get(&(owner, root)).cloned(),
            Mode::Inactive { .. } => None,
        }
    }
}

impl Drop for TriePrefetcher {
    fn drop(&mut self) {
        // Stops the workers even if the owner forgot to close.
        self.close();
    }
}

impl core::fmt::Debug for TriePrefetcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TriePrefetcher")
            .field("root", &self.root)
            .field("active", &matches!(self.mode, Mode::Active { .. }))
            .finish_non_exhaustive()
    }
}

/// The scheduler thread: sole owner of subfetcher lifecycle. Creation,
/// parallel-child spawning and teardown all pass through here, so each
/// message handler stays lightweight.
struct Scheduler {
    db: Arc<dyn TrieOpener>,
    root: B256,
    fetchers: Arc<RwLock<HashMap<TrieId, Subfetcher>>>,
    prefetch_rx: Receiver<PrefetchMsg>,
    abort_rx: Receiver<Subfetcher>,
    close_rx: Receiver<()>,
    done_tx: Sender<()>,
    metrics: PrefetcherMetrics,
}

impl Scheduler {
    fn run(self) {
        loop {
            select! {
                recv(self.prefetch_rx) -> msg => {
                    let Ok(msg) = msg else { return };
                    self.dispatch(msg);
                }
                recv(self.abort_rx) -> fetcher => {
                    let Ok(fetcher) = fetcher else { return };
                    fetcher.abort();
                    for child in fetcher.children() {
                        child.abort();
                    }
                }
                recv(self.close_rx) -> _ => {
                    self.shutdown();
                    return;
                }
            }
        }
    }

    fn dispatch(&self, msg: PrefetchMsg) {
        let id = (msg.owner, msg.root);
        let fetcher = {
            let fetchers = self.fetchers.read();
            fetchers.get(&id).cloned()
        };
        let fetcher = fetcher.unwrap_or_else(|| {
            trace!(target: "prefetch", owner = %msg.owner, root = %msg.root, "Spawning subfetcher");
            let fetcher =
                Subfetcher::new(self.db.clone(), self.root, msg.owner, msg.root, msg.addr);
            self.fetchers.write().insert(id, fetcher.clone());
            fetcher
        });
        if fetcher.is_stopped() {
            return;
        }
        fetcher.schedule(msg.keys.clone());
        // Below the threshold a single worker keeps up on its own.
        if fetcher.pending() > PARALLEL_PREFETCH_THRESHOLD {
            fetcher.schedule_parallel(&self.db, &msg.keys);
        }
    }

    fn shutdown(&self) {
        let snapshot: Vec<Subfetcher> = self.fetchers.read().values().cloned().collect();
        for fetcher in &snapshot {
            fetcher.abort();
            for child in fetcher.children() {
                child.abort();
            }
        }
        for fetcher in &snapshot {
            fetcher.wait_term();
            for child in fetcher.children() {
                child.wait_term();
            }

            let (loaded, dups, skipped, wasted) = fetcher.accounting();
            if fetcher.root() == self.root {
                self.metrics.account_load.increment(loaded);
                self.metrics.account_dup.increment(dups);
                self.metrics.account_skip.increment(skipped);
                self.metrics.account_waste.increment(wasted);
            } else {
                self.metrics.storage_load.increment(loaded);
                self.metrics.storage_dup.increment(dups);
                self.metrics.storage_skip.increment(skipped);
                self.metrics.storage_waste.increment(wasted);
            }
        }
        let _ = self.done_tx.send(());
        self.fetchers.write().clear();
    }
}
