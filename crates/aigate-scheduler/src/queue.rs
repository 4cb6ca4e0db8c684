use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aigate_common::{EngineConfig, Executor, GateError, Outcome, Priority, Request, Response};
use futures_util::FutureExt;
use tokio::sync::{oneshot, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rate_limiter::RateLimiters;
use crate::stats::{QueueStats, RollingWindow};

struct QueueEntry {
    seq: u64,
    request: Request,
    executor: Arc<dyn Executor>,
    reply: oneshot::Sender<Outcome>,
    enqueued_at: Instant,
    timeout: Option<AbortHandle>,
}

/// Everything the scheduler mutates lives behind one lock: the three lanes,
/// the provider buckets, and the rolling windows.
struct QueueState {
    lanes: [VecDeque<QueueEntry>; 3],
    limiters: RateLimiters,
    wait_ms: RollingWindow,
    processing_ms: RollingWindow,
    closed: bool,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    rate_limited: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.enqueued.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.timed_out.store(0, Ordering::Relaxed);
        self.rate_limited.store(0, Ordering::Relaxed);
    }
}

/// Releases a concurrency slot when the execution task ends, even on panic.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle to a queued request's eventual outcome.
#[derive(Debug)]
pub struct Ticket {
    pub request_id: String,
    rx: oneshot::Receiver<Outcome>,
}

impl Ticket {
    pub async fn wait(self) -> Outcome {
        self.rx.await.unwrap_or(Err(GateError::Abandoned))
    }
}

/// Priority admission queue with per-provider token buckets.
///
/// A scheduler tick admits entries while a concurrency slot is free, taking
/// the highest non-empty lane first and FIFO within a lane. An entry whose
/// provider bucket is empty goes back to the front of its lane and that lane
/// is skipped for the rest of the tick.
pub struct AdmissionQueue {
    state: Arc<Mutex<QueueState>>,
    counters: Arc<Counters>,
    in_flight: Arc<AtomicUsize>,
    next_seq: AtomicU64,
    max_concurrency: usize,
    tick_interval: Duration,
    default_timeout: Duration,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("max_concurrency", &self.max_concurrency)
            .field("tick_interval", &self.tick_interval)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

impl AdmissionQueue {
    /// Build a queue without a scheduler loop. Call [`AdmissionQueue::tick`]
    /// manually or [`AdmissionQueue::spawn_scheduler`].
    pub fn new(config: &EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(QueueState {
                lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                limiters: RateLimiters::from_config(config),
                wait_ms: RollingWindow::default(),
                processing_ms: RollingWindow::default(),
                closed: false,
            })),
            counters: Arc::new(Counters::default()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            next_seq: AtomicU64::new(0),
            max_concurrency: config.max_concurrency.max(1),
            tick_interval: config.tick_interval().max(Duration::from_millis(1)),
            default_timeout: config.default_timeout(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Build a queue and start its scheduler loop.
    pub fn start(config: &EngineConfig) -> Arc<Self> {
        let queue = Self::new(config);
        queue.spawn_scheduler();
        queue
    }

    pub fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run().await })
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            tick_ms = self.tick_interval.as_millis() as u64,
            max_concurrency = self.max_concurrency,
            "admission scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("admission scheduler stopped");
    }

    /// Enqueue and wait for the outcome.
    pub async fn enqueue(
        &self,
        request: Request,
        executor: Arc<dyn Executor>,
        timeout: Option<Duration>,
    ) -> Outcome {
        self.push(request, executor, timeout).await?.wait().await
    }

    /// Append `request` to the tail of its lane.
    ///
    /// `timeout` (or the configured default) only covers time spent queued;
    /// once admitted the request runs to completion.
    pub async fn push(
        &self,
        request: Request,
        executor: Arc<dyn Executor>,
        timeout: Option<Duration>,
    ) -> Result<Ticket, GateError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let lane = request.priority.lane_index();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let request_id = request.id.clone();

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(GateError::Shutdown);
        }

        debug!(
            request_id=%request.id,
            provider=%request.provider,
            priority=%request.priority,
            depth = state.lanes[lane].len(),
            "request enqueued"
        );

        let timer = self.spawn_timeout(seq, lane, timeout);
        state.lanes[lane].push_back(QueueEntry {
            seq,
            request,
            executor,
            reply: tx,
            enqueued_at: Instant::now(),
            timeout: Some(timer),
        });
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);

        Ok(Ticket { request_id, rx })
    }

    fn spawn_timeout(&self, seq: u64, lane: usize, timeout: Duration) -> AbortHandle {
        let state = Arc::clone(&self.state);
        let counters = Arc::clone(&self.counters);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let entry = {
                let mut state = state.lock().await;
                let Some(pos) = state.lanes[lane].iter().position(|e| e.seq == seq) else {
                    return;
                };
                state.lanes[lane].remove(pos)
            };
            let Some(entry) = entry else {
                return;
            };

            let waited_ms = entry.enqueued_at.elapsed().as_millis() as u64;
            counters.timed_out.fetch_add(1, Ordering::Relaxed);
            warn!(
                request_id=%entry.request.id,
                provider=%entry.request.provider,
                waited_ms,
                "request timed out in admission queue"
            );
            let _ = entry.reply.send(Err(GateError::QueueTimeout { waited_ms }));
        })
        .abort_handle()
    }

    /// Run one admission pass. Returns how many entries were admitted.
    pub async fn tick(&self) -> usize {
        let now = Instant::now();
        let mut admitted = Vec::new();

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.closed {
                return 0;
            }

            let mut blocked = [false; 3];
            while self.in_flight.load(Ordering::Acquire) + admitted.len() < self.max_concurrency {
                let Some(lane) =
                    (0..state.lanes.len()).find(|&i| !blocked[i] && !state.lanes[i].is_empty())
                else {
                    break;
                };
                let Some(entry) = state.lanes[lane].pop_front() else {
                    break;
                };

                if state.limiters.try_acquire(&entry.request.provider, now) {
                    let wait = now.saturating_duration_since(entry.enqueued_at);
                    state.wait_ms.push(wait.as_millis() as u64);
                    admitted.push(entry);
                } else {
                    self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        request_id=%entry.request.id,
                        provider=%entry.request.provider,
                        lane = Priority::ALL[lane].as_str(),
                        "provider rate limited, deferring lane"
                    );
                    state.lanes[lane].push_front(entry);
                    blocked[lane] = true;
                }
            }
        }

        let count = admitted.len();
        for entry in admitted {
            self.admit(entry, now);
        }
        count
    }

    fn admit(&self, mut entry: QueueEntry, admitted_at: Instant) {
        if let Some(timer) = entry.timeout.take() {
            timer.abort();
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let slot = InFlightGuard(Arc::clone(&self.in_flight));
        let state = Arc::clone(&self.state);
        let counters = Arc::clone(&self.counters);
        let wait = admitted_at.saturating_duration_since(entry.enqueued_at);

        debug!(
            request_id=%entry.request.id,
            provider=%entry.request.provider,
            wait_ms = wait.as_millis() as u64,
            "request admitted"
        );

        let QueueEntry {
            request,
            executor,
            reply,
            ..
        } = entry;

        tokio::spawn(async move {
            let request_id = request.id.clone();
            let provider = request.provider.clone();
            let started = Instant::now();

            let result = AssertUnwindSafe(executor.execute(request))
                .catch_unwind()
                .await;

            let processing = started.elapsed();
            state
                .lock()
                .await
                .processing_ms
                .push(processing.as_millis() as u64);

            let outcome = match result {
                Ok(Ok(completion)) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    Ok(Response::from_completion(request_id, completion, wait + processing))
                }
                Ok(Err(err)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        request_id=%request_id,
                        provider=%provider,
                        executor = executor.name(),
                        error=%err,
                        "executor failed"
                    );
                    Err(GateError::from(err))
                }
                Err(_) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        request_id=%request_id,
                        provider=%provider,
                        executor = executor.name(),
                        "executor panicked"
                    );
                    Err(GateError::Abandoned)
                }
            };

            drop(slot);
            let _ = reply.send(outcome);
        });
    }

    /// Stop the scheduler and reject every still-queued entry with
    /// [`GateError::Shutdown`]. In-flight executions are left to finish.
    /// Returns the number of rejected entries.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();

        let drained: Vec<QueueEntry> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.lanes.iter_mut().flat_map(|lane| lane.drain(..)).collect()
        };

        let rejected = drained.len();
        for mut entry in drained {
            if let Some(timer) = entry.timeout.take() {
                timer.abort();
            }
            let _ = entry.reply.send(Err(GateError::Shutdown));
        }

        info!(rejected, "admission queue shut down");
        rejected
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub async fn pending(&self) -> usize {
        let state = self.state.lock().await;
        state.lanes.iter().map(VecDeque::len).sum()
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            pending_high: state.lanes[Priority::High.lane_index()].len(),
            pending_normal: state.lanes[Priority::Normal.lane_index()].len(),
            pending_low: state.lanes[Priority::Low.lane_index()].len(),
            in_flight: self.in_flight(),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            avg_wait_ms: state.wait_ms.average(),
            avg_processing_ms: state.processing_ms.average(),
        }
    }

    /// Clear counters and rolling windows. Queued and in-flight work is untouched.
    pub async fn reset_stats(&self) {
        let mut state = self.state.lock().await;
        state.wait_ms.clear();
        state.processing_ms.clear();
        self.counters.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigate_common::{executor_fn, Completion, RateLimitConfig};

    fn config(max_concurrency: usize) -> EngineConfig {
        EngineConfig {
            max_concurrency,
            default_rate_limit: RateLimitConfig::new(6000, 100),
            ..Default::default()
        }
    }

    fn recording_executor(log: Arc<std::sync::Mutex<Vec<String>>>) -> Arc<dyn Executor> {
        executor_fn(move |req: Request| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(req.prompt.clone());
                Ok(Completion::new(format!("done {}", req.prompt)))
            }
        })
    }

    async fn drain(queue: &AdmissionQueue) {
        while queue.pending().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            queue.tick().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_jumps_pending_normals() {
        let queue = AdmissionQueue::new(&config(1));
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let exec = recording_executor(log.clone());

        let mut tickets = Vec::new();
        for i in 0..5 {
            let req = Request::new("claude", "m1", format!("n{i}"));
            tickets.push(queue.push(req, exec.clone(), None).await.unwrap());
        }
        assert_eq!(queue.tick().await, 1);

        let high = Request::new("claude", "m1", "h").with_priority(Priority::High);
        tickets.push(queue.push(high, exec.clone(), None).await.unwrap());

        drain(&queue).await;
        for t in tickets {
            t.wait().await.unwrap();
        }

        let order = log.lock().unwrap().clone();
        assert_eq!(order, vec!["n0", "h", "n1", "n2", "n3", "n4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lanes_admit_in_priority_order() {
        let queue = AdmissionQueue::new(&config(1));
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let exec = recording_executor(log.clone());

        let mut tickets = Vec::new();
        for (prompt, priority) in [
            ("low", Priority::Low),
            ("n1", Priority::Normal),
            ("h1", Priority::High),
            ("n2", Priority::Normal),
            ("h2", Priority::High),
        ] {
            let req = Request::new("claude", "m1", prompt).with_priority(priority);
            tickets.push(queue.push(req, exec.clone(), None).await.unwrap());
        }

        let stats = queue.stats().await;
        assert_eq!((stats.pending_high, stats.pending_normal, stats.pending_low), (2, 2, 1));

        drain(&queue).await;
        for t in tickets {
            t.wait().await.unwrap();
        }
        let order = log.lock().unwrap().clone();
        assert_eq!(order, vec!["h1", "h2", "n1", "n2", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_requests_are_deferred_not_rejected() {
        let cfg = EngineConfig {
            max_concurrency: 10,
            ..Default::default()
        }
        .with_rate_limit("claude", RateLimitConfig::new(60, 2));
        let queue = AdmissionQueue::start(&cfg);

        let t0 = Instant::now();
        let starts = Arc::new(std::sync::Mutex::new(Vec::new()));
        let exec = {
            let starts = starts.clone();
            executor_fn(move |_req: Request| {
                let starts = starts.clone();
                async move {
                    starts.lock().unwrap().push(t0.elapsed());
                    Ok(Completion::new("ok"))
                }
            })
        };

        let (a, b, c) = tokio::join!(
            queue.enqueue(Request::new("claude", "m1", "a"), exec.clone(), None),
            queue.enqueue(Request::new("claude", "m1", "b"), exec.clone(), None),
            queue.enqueue(Request::new("claude", "m1", "c"), exec.clone(), None),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());

        let mut starts = starts.lock().unwrap().clone();
        starts.sort();
        assert!(starts[0] < Duration::from_millis(100));
        assert!(starts[1] < Duration::from_millis(100));
        assert!(starts[2] >= Duration::from_millis(900), "third admitted at {:?}", starts[2]);
        assert!(starts[2] <= Duration::from_millis(1200), "third admitted at {:?}", starts[2]);

        let stats = queue.stats().await;
        assert!(stats.rate_limited > 0);
        assert_eq!(stats.completed, 3);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_lane_does_not_block_other_lanes() {
        let cfg = config(10).with_rate_limit("slow", RateLimitConfig::new(0, 1));
        let queue = AdmissionQueue::new(&cfg);
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let exec = recording_executor(log.clone());

        let first = queue
            .push(Request::new("slow", "m", "h0").with_priority(Priority::High), exec.clone(), None)
            .await
            .unwrap();
        let _stuck = queue
            .push(Request::new("slow", "m", "h1").with_priority(Priority::High), exec.clone(), None)
            .await
            .unwrap();
        let other = queue
            .push(Request::new("fast", "m", "n0"), exec.clone(), None)
            .await
            .unwrap();

        assert_eq!(queue.tick().await, 2);
        first.wait().await.unwrap();
        other.wait().await.unwrap();

        let stats = queue.stats().await;
        assert_eq!(stats.pending_high, 1);
        assert_eq!(stats.rate_limited, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_request_times_out() {
        let cfg = config(10).with_rate_limit("claude", RateLimitConfig::new(0, 1));
        let queue = AdmissionQueue::start(&cfg);
        let exec = executor_fn(|_req: Request| async move { Ok(Completion::new("ok")) });

        let first = queue
            .enqueue(Request::new("claude", "m1", "a"), exec.clone(), None)
            .await;
        assert!(first.is_ok());

        let second = queue
            .enqueue(
                Request::new("claude", "m1", "b"),
                exec.clone(),
                Some(Duration::from_millis(500)),
            )
            .await;
        match second {
            Err(GateError::QueueTimeout { waited_ms }) => assert!(waited_ms >= 500),
            other => panic!("expected queue timeout, got {other:?}"),
        }

        let stats = queue.stats().await;
        assert_eq!(stats.pending(), 0);
        assert_eq!(stats.timed_out, 1);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_admitted_request_ignores_timeout() {
        let queue = AdmissionQueue::start(&config(1));
        let exec = executor_fn(|_req: Request| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(Completion::new("slow but fine"))
        });

        let out = queue
            .enqueue(
                Request::new("claude", "m1", "a"),
                exec,
                Some(Duration::from_millis(500)),
            )
            .await
            .unwrap();
        assert_eq!(out.content, "slow but fine");
        assert!(out.duration_ms >= 2000);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_queued_entries() {
        let queue = AdmissionQueue::new(&config(1));
        let exec = executor_fn(|_req: Request| async move { Ok(Completion::new("ok")) });

        let mut tickets = Vec::new();
        for i in 0..3 {
            let req = Request::new("claude", "m1", format!("p{i}"));
            tickets.push(queue.push(req, exec.clone(), None).await.unwrap());
        }

        assert_eq!(queue.shutdown().await, 3);
        assert!(queue.is_shut_down());
        for t in tickets {
            assert!(matches!(t.wait().await, Err(GateError::Shutdown)));
        }

        let late = queue.push(Request::new("claude", "m1", "late"), exec, None).await;
        assert!(matches!(late, Err(GateError::Shutdown)));
        assert_eq!(queue.pending().await, 0);
        assert_eq!(queue.tick().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_failure_and_panic_are_isolated() {
        let queue = AdmissionQueue::new(&config(2));
        let failing = executor_fn(|_req: Request| async move {
            Err::<Completion, _>(anyhow::anyhow!("upstream 500"))
        });
        let panicking = executor_fn(|_req: Request| async move {
            if true {
                panic!("executor bug");
            }
            Ok(Completion::new("unreachable"))
        });
        let ok = executor_fn(|_req: Request| async move { Ok(Completion::new("fine")) });

        let t1 = queue.push(Request::new("p", "m", "a"), failing, None).await.unwrap();
        let t2 = queue.push(Request::new("p", "m", "b"), panicking, None).await.unwrap();
        let t3 = queue.push(Request::new("p", "m", "c"), ok, None).await.unwrap();

        assert_eq!(queue.tick().await, 2);
        let err = t1.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "upstream 500");
        assert!(matches!(t2.wait().await, Err(GateError::Abandoned)));
        assert_eq!(queue.in_flight(), 0);

        assert_eq!(queue.tick().await, 1);
        assert_eq!(t3.wait().await.unwrap().content, "fine");

        let stats = queue.stats().await;
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.completed, 1);

        queue.reset_stats().await;
        let stats = queue.stats().await;
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.avg_processing_ms, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_executor_counts_as_failed() {
        let queue = AdmissionQueue::new(&config(1));
        let panicking = executor_fn(|_req: Request| async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            if true {
                panic!("executor bug");
            }
            Ok(Completion::new("unreachable"))
        });

        let ticket = queue.push(Request::new("p", "m", "a"), panicking, None).await.unwrap();
        assert_eq!(queue.tick().await, 1);
        assert!(matches!(ticket.wait().await, Err(GateError::Abandoned)));

        let stats = queue.stats().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.avg_processing_ms, 40.0);
    }
}
