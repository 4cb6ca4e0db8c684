use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Samples kept for moving averages.
pub const ROLLING_WINDOW: usize = 100;

/// Fixed-capacity window of the most recent samples.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new(ROLLING_WINDOW)
    }
}

/// Read-only snapshot of the admission queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueStats {
    pub pending_high: usize,
    pub pending_normal: usize,
    pub pending_low: usize,
    pub in_flight: usize,
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Admission attempts deferred because the provider bucket was empty.
    pub rate_limited: u64,
    pub avg_wait_ms: f64,
    pub avg_processing_ms: f64,
}

impl QueueStats {
    pub fn pending(&self) -> usize {
        self.pending_high + self.pending_normal + self.pending_low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_window_keeps_last_samples() {
        let mut w = RollingWindow::new(3);
        assert_eq!(w.average(), 0.0);
        for s in [10, 20, 30, 40] {
            w.push(s);
        }
        assert_eq!(w.len(), 3);
        assert_eq!(w.average(), 30.0);
        w.clear();
        assert!(w.is_empty());
    }

    #[test]
    fn test_default_window_is_bounded() {
        let mut w = RollingWindow::default();
        for s in 0..250u64 {
            w.push(s);
        }
        assert_eq!(w.len(), ROLLING_WINDOW);
        assert_eq!(w.average(), (150..250u64).sum::<u64>() as f64 / 100.0);
    }
}
