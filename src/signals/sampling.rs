//! Thompson Sampling for source reliability.
//!
//! Each `(source, signal_type)` pair carries a Beta(alpha, beta) posterior
//! fed by user corrections. Drawing from it rather than using the mean
//! keeps exploring sources whose reliability is still uncertain.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Beta, Distribution};

use crate::db::{DbError, SignalDb};

/// Corrections required before draws replace the neutral prior.
pub const DEFAULT_MIN_UPDATES: i64 = 5;

/// Samples learned reliability. The RNG is owned here so a fixed seed
/// reproduces an entire run.
pub struct ReliabilityLearner {
    rng: Mutex<StdRng>,
    min_updates: i64,
}

impl ReliabilityLearner {
    /// `seed = None` seeds from entropy.
    pub fn new(seed: Option<u64>, min_updates: i64) -> Self {
        let seed = seed.unwrap_or_else(rand::random::<u64>);
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            min_updates,
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(Some(seed), DEFAULT_MIN_UPDATES)
    }

    /// Learned reliability for a source, in [0.01, 0.99].
    ///
    /// Exactly 0.5 until the pair has seen `min_updates` corrections.
    pub fn sample_reliability(&self, db: &SignalDb, source: &str, signal_type: &str) -> Result<f64, DbError> {
        let weight = db.get_signal_weight(source, signal_type)?;
        Ok(match weight {
            Some(w) if w.update_count >= self.min_updates => self.draw(w.alpha, w.beta),
            _ => 0.5,
        })
    }

    /// One Thompson draw from Beta(alpha, beta).
    pub fn draw(&self, alpha: f64, beta: f64) -> f64 {
        let a = alpha.max(0.01);
        let b = beta.max(0.01);
        match Beta::new(a, b) {
            Ok(dist) => {
                let mut rng = self.rng.lock();
                dist.sample(&mut *rng).clamp(0.01, 0.99)
            }
            Err(_) => mean_reliability(alpha, beta),
        }
    }
}

/// Deterministic reliability estimate: the Beta mean. For display and logging.
pub fn mean_reliability(alpha: f64, beta: f64) -> f64 {
    let a = alpha.max(0.01);
    let b = beta.max(0.01);
    a / (a + b)
}
