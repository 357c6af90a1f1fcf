use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Source of fresh node and data identifiers.
pub trait IdentifierSource: Send + Sync {
    /// Returns an identifier not returned before by this source.
    fn generate(&self) -> String;
}

/// 128-bit random identifiers rendered as 32 lowercase hex digits.
pub struct RandomIds {
    rng: Mutex<ChaCha8Rng>,
}

impl RandomIds {
    /// Source seeded from the operating system.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::from_entropy()),
        }
    }

    /// Deterministic source for reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentifierSource for RandomIds {
    fn generate(&self) -> String {
        let mut raw = [0u8; 16];
        self.rng.lock().fill_bytes(&mut raw);
        hex::encode(raw)
    }
}

/// Monotonic counter identifiers, zero padded so they sort numerically.
#[derive(Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    /// Counter starting at `start`.
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl IdentifierSource for SequentialIds {
    fn generate(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{n:016x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn random_ids_are_hex_and_unique() {
        let ids = RandomIds::new();
        let mut seen = FxHashSet::default();
        for _ in 0..1000 {
            let id = ids.generate();
            assert_eq!(id.len(), 32);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn seeded_sources_repeat() {
        let a = RandomIds::seeded(7);
        let b = RandomIds::seeded(7);
        assert_eq!(a.generate(), b.generate());
    }

    #[test]
    fn sequential_ids_sort_in_order() {
        let ids = SequentialIds::starting_at(9);
        let first = ids.generate();
        let second = ids.generate();
        assert!(first < second);
        assert_eq!(second, "000000000000000a");
    }
}
