use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aigate_common::{GateError, Outcome};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::fingerprint::Fingerprint;

type Slot = Arc<watch::Sender<Option<Outcome>>>;
type PendingMap = DashMap<Fingerprint, PendingExecution>;

struct PendingExecution {
    generation: u64,
    owner: String,
    slot: Slot,
    created_at: Instant,
    waiters: Vec<String>,
}

/// Result of [`DedupRegistry::try_join`].
pub enum Join {
    /// No execution was in flight. The caller now owns one and must settle it.
    Owner(Registration),
    /// An execution is already in flight; wait for its outcome.
    Waiter(Waiter),
}

/// Ownership of one in-flight execution.
///
/// Settling publishes the outcome and removes the registry entry. Dropping
/// an unsettled registration removes the entry too, and its waiters resolve
/// to [`GateError::Abandoned`].
pub struct Registration {
    fingerprint: Fingerprint,
    generation: u64,
    slot: Slot,
    pending: Arc<PendingMap>,
    settled: bool,
}

impl Registration {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// A handle that resolves with whatever this registration settles to.
    pub fn subscribe(&self) -> Waiter {
        Waiter {
            rx: self.slot.subscribe(),
        }
    }

    pub fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        let ok = outcome.is_ok();
        match remove_generation(&self.pending, &self.fingerprint, self.generation) {
            Some(entry) => debug!(
                fingerprint = self.fingerprint.short(),
                owner = %entry.owner,
                waiters = entry.waiters.len(),
                ok,
                "shared execution settled"
            ),
            None => debug!(
                fingerprint = self.fingerprint.short(),
                ok,
                "shared execution settled after its entry was swept"
            ),
        }
        self.slot.send_replace(Some(outcome));
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.settled {
            remove_generation(&self.pending, &self.fingerprint, self.generation);
        }
    }
}

fn remove_generation(pending: &PendingMap, fp: &Fingerprint, generation: u64) -> Option<PendingExecution> {
    pending
        .remove_if(fp, |_, entry| entry.generation == generation)
        .map(|(_, entry)| entry)
}

/// Pending handle on a shared execution's outcome.
pub struct Waiter {
    rx: watch::Receiver<Option<Outcome>>,
}

impl Waiter {
    pub async fn wait(mut self) -> Outcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone().unwrap_or(Err(GateError::Abandoned)),
            Err(_) => Err(GateError::Abandoned),
        }
    }
}

/// In-flight executions keyed by fingerprint. At most one entry per key.
#[derive(Default)]
pub struct DedupRegistry {
    pending: Arc<PendingMap>,
    next_generation: AtomicU64,
}

impl DedupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_join(&self, fp: &Fingerprint, request_id: &str) -> Join {
        match self.pending.entry(fp.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.waiters.push(request_id.to_string());
                debug!(
                    fingerprint = fp.short(),
                    request_id,
                    owner = %entry.owner,
                    waiters = entry.waiters.len(),
                    "joined in-flight execution"
                );
                Join::Waiter(Waiter {
                    rx: entry.slot.subscribe(),
                })
            }
            Entry::Vacant(vacant) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let slot: Slot = Arc::new(watch::channel(None).0);
                vacant.insert(PendingExecution {
                    generation,
                    owner: request_id.to_string(),
                    slot: slot.clone(),
                    created_at: Instant::now(),
                    waiters: Vec::new(),
                });
                Join::Owner(Registration {
                    fingerprint: fp.clone(),
                    generation,
                    slot,
                    pending: self.pending.clone(),
                    settled: false,
                })
            }
        }
    }

    /// Remove entries older than `stale_after` and release everyone awaiting
    /// them with [`GateError::StaleDedup`]. Returns how many were removed.
    pub fn sweep(&self, stale_after: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<(Fingerprint, u64)> = self
            .pending
            .iter()
            .filter(|e| now.saturating_duration_since(e.created_at) >= stale_after)
            .map(|e| (e.key().clone(), e.generation))
            .collect();

        let mut removed = 0;
        for (fp, generation) in stale {
            let Some(entry) = remove_generation(&self.pending, &fp, generation) else {
                continue;
            };
            let age_ms = now.saturating_duration_since(entry.created_at).as_millis() as u64;
            warn!(
                fingerprint = fp.short(),
                owner = %entry.owner,
                waiters = entry.waiters.len(),
                age_ms,
                "removing stale dedup entry"
            );
            entry
                .slot
                .send_replace(Some(Err(GateError::StaleDedup { age_ms })));
            removed += 1;
        }
        removed
    }

    /// Request ids currently waiting on `fp`, owner excluded.
    pub fn waiters(&self, fp: &Fingerprint) -> Vec<String> {
        self.pending
            .get(fp)
            .map(|e| e.waiters.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.pending.contains_key(fp)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigate_common::{Completion, Request, Response};

    use crate::fingerprint::fingerprint;

    fn fp(prompt: &str) -> Fingerprint {
        fingerprint(&Request::new("claude", "m1", prompt))
    }

    fn owner(join: Join) -> Registration {
        match join {
            Join::Owner(reg) => reg,
            Join::Waiter(_) => panic!("expected owner"),
        }
    }

    fn waiter(join: Join) -> Waiter {
        match join {
            Join::Waiter(w) => w,
            Join::Owner(_) => panic!("expected waiter"),
        }
    }

    #[tokio::test]
    async fn test_waiters_receive_owner_outcome() {
        let registry = DedupRegistry::new();
        let key = fp("Hello world");

        let reg = owner(registry.try_join(&key, "r1"));
        let own = reg.subscribe();
        let w2 = waiter(registry.try_join(&key, "r2"));
        let w3 = waiter(registry.try_join(&key, "r3"));
        assert_eq!(registry.waiters(&key), vec!["r2", "r3"]);
        assert_eq!(registry.len(), 1);

        let resp = Response::from_completion("r1", Completion::new("X"), Duration::ZERO);
        reg.settle(Ok(resp.clone()));
        assert!(registry.is_empty());

        assert_eq!(own.wait().await.unwrap(), resp);
        assert_eq!(w2.wait().await.unwrap(), resp);
        assert_eq!(w3.wait().await.unwrap(), resp);
    }

    #[tokio::test]
    async fn test_settled_error_reaches_every_waiter() {
        let registry = DedupRegistry::new();
        let key = fp("boom");

        let reg = owner(registry.try_join(&key, "r1"));
        let w = waiter(registry.try_join(&key, "r2"));
        reg.settle(Err(GateError::QueueTimeout { waited_ms: 10 }));

        assert!(matches!(w.wait().await, Err(GateError::QueueTimeout { waited_ms: 10 })));
        assert!(matches!(registry.try_join(&key, "r3"), Join::Owner(_)));
    }

    #[tokio::test]
    async fn test_dropped_registration_unblocks_fingerprint() {
        let registry = DedupRegistry::new();
        let key = fp("dropped");

        let reg = owner(registry.try_join(&key, "r1"));
        let w = waiter(registry.try_join(&key, "r2"));
        drop(reg);

        assert!(!registry.contains(&key));
        assert!(matches!(w.wait().await, Err(GateError::Abandoned)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_releases_stale_waiters() {
        let registry = DedupRegistry::new();
        let stale = fp("never settles");
        let fresh = fp("fresh");

        let old_reg = owner(registry.try_join(&stale, "r1"));
        let w = waiter(registry.try_join(&stale, "r2"));

        tokio::time::advance(Duration::from_secs(150)).await;
        let _fresh_reg = owner(registry.try_join(&fresh, "r3"));

        assert_eq!(registry.sweep(Duration::from_secs(120)), 1);
        assert!(!registry.contains(&stale));
        assert!(registry.contains(&fresh));
        match w.wait().await {
            Err(GateError::StaleDedup { age_ms }) => assert!(age_ms >= 150_000),
            other => panic!("expected stale dedup, got {other:?}"),
        }

        // A late settle must not evict a newer execution for the same key.
        let new_reg = owner(registry.try_join(&stale, "r4"));
        old_reg.settle(Ok(Response::from_completion("r1", Completion::new("late"), Duration::ZERO)));
        assert!(registry.contains(new_reg.fingerprint()));
    }
}
