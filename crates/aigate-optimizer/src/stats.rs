use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Read-only snapshot of what the optimizer saved.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OptimizationStats {
    pub total: u64,
    pub cached: u64,
    pub deduplicated: u64,
    pub cache_errors: u64,
    /// `cached / total`, 0 when nothing was submitted.
    pub cache_hit_rate: f64,
    /// `deduplicated / total`, 0 when nothing was submitted.
    pub dedup_rate: f64,
    /// Tokens not sent to a provider: cache hits, dedup joins and the
    /// normalizer's estimate.
    pub tokens_saved: u64,
    /// Provider cost avoided by cache hits and dedup joins, in USD.
    pub cost_saved: f64,
    pub pending_executions: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub total: AtomicU64,
    pub cached: AtomicU64,
    pub deduplicated: AtomicU64,
    pub tokens_saved: AtomicU64,
    cost_saved_bits: AtomicU64,
}

impl Counters {
    pub fn add_cost_saved(&self, cost: f64) {
        if cost <= 0.0 || !cost.is_finite() {
            return;
        }
        let _ = self
            .cost_saved_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + cost).to_bits())
            });
    }

    pub fn cost_saved(&self) -> f64 {
        f64::from_bits(self.cost_saved_bits.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self, cache_errors: u64, pending_executions: usize) -> OptimizationStats {
        let total = self.total.load(Ordering::Relaxed);
        let cached = self.cached.load(Ordering::Relaxed);
        let deduplicated = self.deduplicated.load(Ordering::Relaxed);
        let rate = |n: u64| if total == 0 { 0.0 } else { n as f64 / total as f64 };

        OptimizationStats {
            total,
            cached,
            deduplicated,
            cache_errors,
            cache_hit_rate: rate(cached),
            dedup_rate: rate(deduplicated),
            tokens_saved: self.tokens_saved.load(Ordering::Relaxed),
            cost_saved: self.cost_saved(),
            pending_executions,
        }
    }

    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.cached.store(0, Ordering::Relaxed);
        self.deduplicated.store(0, Ordering::Relaxed);
        self.tokens_saved.store(0, Ordering::Relaxed);
        self.cost_saved_bits.store(0f64.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_and_cost_accumulate() {
        let c = Counters::default();
        assert_eq!(c.snapshot(0, 0).cache_hit_rate, 0.0);

        c.total.store(4, Ordering::Relaxed);
        c.cached.store(1, Ordering::Relaxed);
        c.deduplicated.store(2, Ordering::Relaxed);
        c.add_cost_saved(0.25);
        c.add_cost_saved(0.5);
        c.add_cost_saved(f64::NAN);

        let s = c.snapshot(3, 1);
        assert_eq!(s.cache_hit_rate, 0.25);
        assert_eq!(s.dedup_rate, 0.5);
        assert_eq!(s.cost_saved, 0.75);
        assert_eq!(s.cache_errors, 3);
        assert_eq!(s.pending_executions, 1);

        c.reset();
        assert_eq!(c.snapshot(0, 0), OptimizationStats::default());
    }
}
