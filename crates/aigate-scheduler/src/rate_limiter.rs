use std::collections::{BTreeMap, HashMap};

use aigate_common::{EngineConfig, RateLimitConfig};
use tokio::time::Instant;

/// Tolerance for refill drift accumulated over many small ticks.
const TOKEN_EPSILON: f64 = 1e-9;

/// Token bucket for a single provider.
///
/// `tokens` never exceeds `burst` and never goes negative; refill is linear in
/// elapsed time and `last_refill` only moves forward.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    burst: f64,
    per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket as of `now`.
    pub fn new_at(limit: RateLimitConfig, now: Instant) -> Self {
        let burst = limit.burst as f64;
        Self {
            tokens: burst,
            burst,
            per_second: limit.tokens_per_second(),
            last_refill: now,
        }
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.per_second).min(self.burst);
        self.last_refill = now;
    }
}

/// One bucket per provider, created on first use.
#[derive(Debug, Clone)]
pub struct RateLimiters {
    default_limit: RateLimitConfig,
    overrides: BTreeMap<String, RateLimitConfig>,
    buckets: HashMap<String, TokenBucket>,
}

impl RateLimiters {
    pub fn new(default_limit: RateLimitConfig, overrides: BTreeMap<String, RateLimitConfig>) -> Self {
        Self {
            default_limit,
            overrides,
            buckets: HashMap::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.default_rate_limit, config.rate_limits.clone())
    }

    fn limit_for(&self, provider: &str) -> RateLimitConfig {
        self.overrides
            .get(provider)
            .copied()
            .unwrap_or(self.default_limit)
    }

    pub fn try_acquire(&mut self, provider: &str, now: Instant) -> bool {
        if !self.buckets.contains_key(provider) {
            let limit = self.limit_for(provider);
            tracing::debug!(provider, burst = limit.burst, per_minute = limit.per_minute, "creating rate limiter");
            self.buckets
                .insert(provider.to_string(), TokenBucket::new_at(limit, now));
        }
        match self.buckets.get_mut(provider) {
            Some(bucket) => bucket.try_acquire_at(now),
            None => false,
        }
    }
}
