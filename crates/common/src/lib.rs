//! Shared utilities used across the lamina crates.

mod rng;
mod size;

pub use rng::ReseedingRng;
pub use size::StorageSize;
