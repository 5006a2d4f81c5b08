//! Speculative trie prefetcher.
//!
//! While the execution layer is still deciding what it will touch, the
//! prefetcher pulls the likely keys through the tries so the node caches are
//! warm by the time execution commits to them. One background worker runs
//! per trie encountered in the executing block; workers that fall behind
//! spawn bounded parallel children. The prefetcher never mutates state, it
//! only populates caches.

mod prefetcher;
mod subfetcher;

pub use prefetcher::TriePrefetcher;
