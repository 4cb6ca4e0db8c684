use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Token-bucket parameters for one provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Sustained refill rate.
    pub per_minute: u32,
    /// Maximum burst (bucket capacity).
    pub burst: u32,
}

impl RateLimitConfig {
    /// Arguments follow the field order and the `provider:per_minute:burst`
    /// flag syntax.
    pub fn new(per_minute: u32, burst: u32) -> Self {
        Self { per_minute, burst }
    }

    pub fn tokens_per_second(&self) -> f64 {
        self.per_minute as f64 / 60.0
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 60,
            burst: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Executions allowed in flight at once.
    pub max_concurrency: usize,
    /// Admission scheduler tick.
    pub tick_interval_ms: u64,
    /// Queue timeout used when a caller does not pass one.
    pub default_timeout_ms: u64,
    /// TTL for stored responses.
    pub cache_ttl_ms: u64,
    /// How often the dedup registry is swept for stale entries.
    pub dedup_sweep_interval_ms: u64,
    /// Age after which a pending execution is considered stale.
    pub dedup_stale_after_ms: u64,
    /// Bucket used for providers without an explicit entry.
    pub default_rate_limit: RateLimitConfig,
    /// Per-provider overrides, keyed by provider name.
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            tick_interval_ms: 100,
            default_timeout_ms: 30_000,
            cache_ttl_ms: 3_600_000,
            dedup_sweep_interval_ms: 30_000,
            dedup_stale_after_ms: 120_000,
            default_rate_limit: RateLimitConfig::default(),
            rate_limits: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn dedup_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.dedup_sweep_interval_ms.max(1))
    }

    pub fn dedup_stale_after(&self) -> Duration {
        Duration::from_millis(self.dedup_stale_after_ms)
    }

    /// Limits that apply to `provider`.
    pub fn rate_limit_for(&self, provider: &str) -> RateLimitConfig {
        self.rate_limits
            .get(provider)
            .copied()
            .unwrap_or(self.default_rate_limit)
    }

    pub fn with_rate_limit(mut self, provider: impl Into<String>, limit: RateLimitConfig) -> Self {
        self.rate_limits.insert(provider.into(), limit);
        self
    }

    /// Defaults overlaid with `AIGATE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        let parse_u64 = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value=%raw, "invalid integer in environment, using default");
                    None
                }
            }
        };

        if let Some(v) = parse_u64("AIGATE_MAX_CONCURRENCY") {
            cfg.max_concurrency = (v as usize).max(1);
        }
        if let Some(v) = parse_u64("AIGATE_TICK_MS") {
            cfg.tick_interval_ms = v.max(1);
        }
        if let Some(v) = parse_u64("AIGATE_TIMEOUT_MS") {
            cfg.default_timeout_ms = v;
        }
        if let Some(v) = parse_u64("AIGATE_CACHE_TTL_MS") {
            cfg.cache_ttl_ms = v;
        }
        if let Some(v) = parse_u64("AIGATE_DEDUP_SWEEP_MS") {
            cfg.dedup_sweep_interval_ms = v.max(1);
        }
        if let Some(v) = parse_u64("AIGATE_DEDUP_STALE_MS") {
            cfg.dedup_stale_after_ms = v;
        }
        if let Some(raw) = lookup("AIGATE_DEFAULT_RATE_LIMIT") {
            match parse_limit(raw.trim()) {
                Some(limit) => cfg.default_rate_limit = limit,
                None => {
                    tracing::warn!(value=%raw, "invalid AIGATE_DEFAULT_RATE_LIMIT, expected per_minute:burst")
                }
            }
        }
        if let Some(raw) = lookup("AIGATE_RATE_LIMITS") {
            cfg.rate_limits.extend(parse_rate_limits(&raw));
        }

        cfg
    }
}

/// Parse `provider:per_minute:burst` entries separated by commas.
pub fn parse_rate_limits(raw: &str) -> BTreeMap<String, RateLimitConfig> {
    let mut out = BTreeMap::new();
    for entry in raw.split(',') {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((provider, limit_raw)) = trimmed.split_once(':') else {
            tracing::warn!(entry=%trimmed, "invalid AIGATE_RATE_LIMITS entry, expected provider:per_minute:burst");
            continue;
        };
        let Some(limit) = parse_limit(limit_raw) else {
            tracing::warn!(entry=%trimmed, "invalid AIGATE_RATE_LIMITS entry, expected provider:per_minute:burst");
            continue;
        };
        if provider.is_empty() {
            tracing::warn!(entry=%trimmed, "empty provider in AIGATE_RATE_LIMITS, skipping");
            continue;
        }
        out.insert(provider.to_string(), limit);
    }
    out
}

fn parse_limit(raw: &str) -> Option<RateLimitConfig> {
    let (per_minute, burst) = raw.split_once(':')?;
    let per_minute = per_minute.trim().parse::<u32>().ok()?;
    let burst = burst.trim().parse::<u32>().ok()?;
    if burst == 0 {
        return None;
    }
    Some(RateLimitConfig { burst, per_minute })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_rate_limits() {
        let limits = parse_rate_limits("claude:60:2, openai:120:10,bogus,gemini:x:1,:5:5");
        assert_eq!(limits.len(), 2);
        assert_eq!(limits["claude"], RateLimitConfig::new(60, 2));
        assert_eq!(limits["openai"], RateLimitConfig::new(120, 10));
    }

    #[test]
    fn test_from_lookup_overlays_defaults() {
        let env: HashMap<&str, &str> = [
            ("AIGATE_MAX_CONCURRENCY", "1"),
            ("AIGATE_TICK_MS", "50"),
            ("AIGATE_CACHE_TTL_MS", "not-a-number"),
            ("AIGATE_RATE_LIMITS", "claude:60:2"),
            ("AIGATE_DEFAULT_RATE_LIMIT", "30:3"),
        ]
        .into_iter()
        .collect();

        let cfg = EngineConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.max_concurrency, 1);
        assert_eq!(cfg.tick_interval(), Duration::from_millis(50));
        assert_eq!(cfg.cache_ttl_ms, EngineConfig::default().cache_ttl_ms);
        assert_eq!(cfg.rate_limit_for("claude"), RateLimitConfig::new(60, 2));
        assert_eq!(cfg.rate_limit_for("unknown"), RateLimitConfig::new(30, 3));
    }

    #[test]
    fn test_tokens_per_second() {
        assert!((RateLimitConfig::new(90, 1).tokens_per_second() - 1.5).abs() < f64::EPSILON);
    }
}
