use parking_lot::Mutex;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

/// A shared pseudo-random source seeded from OS entropy.
///
/// Consumers that break ties randomly (e.g. fork choice between two heads of
/// equal weight) want reproducible-quality randomness without constructing a
/// generator per call site. The generator is re-seedable so long-lived
/// processes can periodically refresh it from the OS.
#[derive(Debug)]
pub struct ReseedingRng {
    inner: Mutex<StdRng>,
}

impl ReseedingRng {
    /// Creates a new generator seeded from OS entropy.
    pub fn new() -> Self {
        Self { inner: Mutex::new(StdRng::from_entropy()) }
    }

    /// Replaces the internal generator with a freshly seeded one.
    pub fn reseed(&self) {
        *self.inner.lock() = StdRng::from_entropy();
    }

    /// Returns a uniformly distributed integer in `[0, n)`.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    pub fn intn(&self, n: usize) -> usize {
        self.inner.lock().gen_range(0..n)
    }

    /// Returns a uniformly distributed 63-bit integer in `[0, n)`.
    ///
    /// # Panics
    ///
    /// Panics if `n` is not positive.
    pub fn int63n(&self, n: i64) -> i64 {
        self.inner.lock().gen_range(0..n)
    }

    /// Shuffles the given slice in place.
    pub fn shuffle<T>(&self, values: &mut [T]) {
        values.shuffle(&mut *self.inner.lock());
    }
}

impl Default for ReseedingRng {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intn_is_bounded() {
        let rng = ReseedingRng::new();
        for _ in 0..64 {
            assert!(rng.intn(7) < 7);
            assert!(rng.int63n(3) < 3);
        }
    }

    #[test]
    fn shuffle_preserves_elements() {
        let rng = ReseedingRng::new();
        let mut values: Vec<u32> = (0..32).collect();
        rng.shuffle(&mut values);
        values.sort_unstable();
        assert_eq!(values, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn reseed_keeps_generator_usable() {
        let rng = ReseedingRng::new();
        rng.reseed();
        assert!(rng.intn(2) < 2);
    }
}
