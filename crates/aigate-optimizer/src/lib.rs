use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use aigate_cache::CacheStore;
use aigate_common::{EngineConfig, Executor, GateError, Outcome, Request, Response};
use aigate_scheduler::{AdmissionQueue, QueueStats};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod cache;
pub mod dedup;
pub mod fingerprint;
pub mod metrics;
pub mod stats;

use cache::ResponseCache;
use dedup::{DedupRegistry, Join};
use fingerprint::{fingerprint, normalize, Fingerprint};
pub use metrics::render_metrics;
pub use stats::OptimizationStats;

/// Single entry point for provider calls.
///
/// `submit` runs normalize, fingerprint, cache lookup and dedup join, and only
/// then goes through the admission queue. One shared execution per
/// fingerprint fans its outcome out to every caller attached to it.
pub struct Optimizer {
    queue: Arc<AdmissionQueue>,
    cache: Arc<ResponseCache>,
    dedup: Arc<DedupRegistry>,
    counters: stats::Counters,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Optimizer")
            .field("queue", &self.queue)
            .field("cache_backend", &self.cache.backend())
            .field("pending_executions", &self.dedup.len())
            .finish()
    }
}

impl Optimizer {
    /// Build an engine and start its scheduler and dedup sweep loops.
    /// Must be called from within a tokio runtime.
    pub fn new(config: EngineConfig, store: Arc<dyn CacheStore>) -> Arc<Self> {
        info!(
            max_concurrency = config.max_concurrency,
            tick_ms = config.tick_interval_ms,
            cache_ttl_ms = config.cache_ttl_ms,
            cache_backend = store.backend(),
            providers = config.rate_limits.len(),
            "optimizer initialized"
        );

        let optimizer = Arc::new(Self {
            queue: AdmissionQueue::start(&config),
            cache: Arc::new(ResponseCache::new(store, config.cache_ttl())),
            dedup: Arc::new(DedupRegistry::new()),
            counters: stats::Counters::default(),
            shutdown: CancellationToken::new(),
        });
        optimizer.spawn_dedup_sweep(config.dedup_sweep_interval(), config.dedup_stale_after());
        optimizer
    }

    fn spawn_dedup_sweep(&self, every: Duration, stale_after: Duration) {
        let dedup = Arc::clone(&self.dedup);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = dedup.sweep(stale_after);
                        if removed > 0 {
                            debug!(removed, remaining = dedup.len(), "dedup sweep");
                        }
                    }
                }
            }
        });
    }

    /// Submit a request and wait for its response.
    ///
    /// `timeout` bounds time spent queued before admission and defaults to
    /// the configured value. Executor errors come back unwrapped.
    pub async fn submit(
        &self,
        request: Request,
        executor: Arc<dyn Executor>,
        timeout: Option<Duration>,
    ) -> Outcome {
        if self.shutdown.is_cancelled() {
            return Err(GateError::Shutdown);
        }

        let started = Instant::now();
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let normalized = normalize(&request);
        self.counters
            .tokens_saved
            .fetch_add(normalized.estimated_tokens_saved(), Ordering::Relaxed);
        let request = normalized.request;
        let fp = fingerprint(&request);

        if request.cacheable {
            if let Some(hit) = self.cache.lookup(&fp).await {
                self.counters.cached.fetch_add(1, Ordering::Relaxed);
                self.record_savings(&hit);
                debug!(request_id=%request.id, fingerprint = fp.short(), "cache hit");
                return Ok(Response {
                    id: request.id,
                    cached: true,
                    deduplicated: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                    ..hit
                });
            }
        }

        match self.dedup.try_join(&fp, &request.id) {
            Join::Waiter(waiter) => {
                self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
                let shared = waiter.wait().await?;
                self.record_savings(&shared);
                Ok(Response {
                    id: request.id,
                    cached: false,
                    deduplicated: true,
                    ..shared
                })
            }
            Join::Owner(registration) => {
                let own = registration.subscribe();
                let queue = Arc::clone(&self.queue);
                let cache = Arc::clone(&self.cache);
                tokio::spawn(async move {
                    let cacheable = request.cacheable;
                    let outcome = queue.enqueue(request, executor, timeout).await;
                    if let (Ok(resp), true) = (&outcome, cacheable) {
                        cache.store(registration.fingerprint(), resp).await;
                    }
                    registration.settle(outcome);
                });
                own.wait().await
            }
        }
    }

    fn record_savings(&self, resp: &Response) {
        self.counters
            .tokens_saved
            .fetch_add(resp.total_tokens(), Ordering::Relaxed);
        self.counters.add_cost_saved(resp.cost);
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    pub fn optimization_stats(&self) -> OptimizationStats {
        self.counters
            .snapshot(self.cache.errors(), self.dedup.len())
    }

    /// Prometheus text for both snapshots.
    pub async fn render_metrics(&self) -> String {
        render_metrics(&self.queue_stats().await, &self.optimization_stats())
    }

    /// Clear counters and rolling windows. Queued and in-flight work is untouched.
    pub async fn reset_stats(&self) {
        self.counters.reset();
        self.cache.reset_errors();
        self.queue.reset_stats().await;
        info!("optimizer stats reset");
    }

    /// Stop the scheduler and the dedup sweep, rejecting every queued request
    /// with [`GateError::Shutdown`]. Running executions finish on their own.
    /// Returns the number of rejected requests.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        self.queue.shutdown().await
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn contains_pending(&self, fp: &Fingerprint) -> bool {
        self.dedup.contains(fp)
    }
}
