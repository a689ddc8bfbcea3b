//! Seeded RNG wrapper for reproducible behavior.
//!
//! Mock handlers draw site populations and injected failures from one
//! seeded generator so a failing run can be replayed.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seeded random number generator shared by a mock handler.
pub struct MockRng {
    inner: Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// Create a new RNG; without a seed the OS provides one.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// True with probability `rate` (clamped to 0.0..=1.0).
    pub fn chance(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().gen::<f64>() < rate
    }

    /// Pending flags for one device cycle: each active site receives a
    /// device with probability `fill_rate`, inactive sites never do.
    pub fn population(&self, active: &[bool], fill_rate: f64) -> Vec<bool> {
        active
            .iter()
            .map(|&site_active| site_active && self.chance(fill_rate))
            .collect()
    }
}

impl Default for MockRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for MockRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRng")
            .field("inner", &"<Mutex<ChaCha8Rng>>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_populations_repeat() {
        let a = MockRng::new(Some(42));
        let b = MockRng::new(Some(42));
        let active = [true; 16];
        for _ in 0..10 {
            assert_eq!(a.population(&active, 0.5), b.population(&active, 0.5));
        }
    }

    #[test]
    fn inactive_sites_stay_empty() {
        let rng = MockRng::new(Some(1));
        assert_eq!(
            rng.population(&[true, false, true], 1.0),
            vec![true, false, true]
        );
    }

    #[test]
    fn chance_bounds() {
        let rng = MockRng::new(Some(7));
        for _ in 0..100 {
            assert!(!rng.chance(0.0));
            assert!(rng.chance(1.0));
        }
    }

    #[test]
    fn chance_follows_rate() {
        let rng = MockRng::new(Some(42));
        let hits = (0..10_000).filter(|_| rng.chance(0.3)).count();
        assert!((2700..3300).contains(&hits), "got {} hits", hits);
    }
}
