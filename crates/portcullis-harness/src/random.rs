//! Scripted random sources.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use portcullis_core::{entropy::RandomSource, error::EntropyError};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Deterministic source backed by ChaCha20.
#[derive(Debug, Clone)]
pub struct SeededRandom(ChaCha20Rng);

impl SeededRandom {
    /// Source seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self(ChaCha20Rng::seed_from_u64(seed))
    }
}

impl RandomSource for SeededRandom {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), EntropyError> {
        self.0.fill_bytes(buf);
        Ok(())
    }
}

/// Source that never delivers. Clones share the attempt counter.
#[derive(Debug, Clone, Default)]
pub struct StarvedRandom {
    attempts: Arc<AtomicUsize>,
}

impl StarvedRandom {
    /// New starved source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `fill` calls so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl RandomSource for StarvedRandom {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), EntropyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(EntropyError::Insufficient { requested: buf.len(), received: 0 })
    }
}

/// Fails a fixed number of times, then behaves like [`SeededRandom`].
#[derive(Debug, Clone)]
pub struct FlakyRandom {
    failures_left: usize,
    attempts: usize,
    inner: SeededRandom,
}

impl FlakyRandom {
    /// Source that fails `failures` times before succeeding.
    pub fn new(failures: usize, seed: u64) -> Self {
        Self { failures_left: failures, attempts: 0, inner: SeededRandom::new(seed) }
    }

    /// Number of `fill` calls so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

impl RandomSource for FlakyRandom {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), EntropyError> {
        self.attempts += 1;
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(EntropyError::Unreachable {
                attempts: 1,
                reason: "connection refused".to_string(),
            });
        }
        self.inner.fill(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_bytes() {
        let (mut a, mut b) = (SeededRandom::new(9), SeededRandom::new(9));
        let (mut x, mut y) = ([0u8; 16], [0u8; 16]);
        a.fill(&mut x).unwrap();
        b.fill(&mut y).unwrap();
        assert_eq!(x, y);
    }

    #[test]
    fn flaky_recovers() {
        let mut source = FlakyRandom::new(2, 1);
        let mut buf = [0u8; 8];
        assert!(source.fill(&mut buf).is_err());
        assert!(source.fill(&mut buf).is_err());
        assert!(source.fill(&mut buf).is_ok());
        assert_eq!(source.attempts(), 3);
    }
}
