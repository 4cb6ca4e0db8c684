use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aigate_cache::CacheStore;
use aigate_common::Response;
use tracing::{debug, warn};

use crate::fingerprint::Fingerprint;

/// Response cache over an external [`CacheStore`].
///
/// Store failures never reach the caller: a failed read is a miss and a failed
/// write is dropped. Both are logged and counted in `errors`.
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    errors: AtomicU64,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            errors: AtomicU64::new(0),
        }
    }

    pub async fn lookup(&self, fp: &Fingerprint) -> Option<Response> {
        let bytes = match self.store.get(fp.as_str()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    fingerprint = fp.short(),
                    backend = self.store.backend(),
                    error=%err,
                    "cache unavailable, treating as miss"
                );
                return None;
            }
        };

        match serde_json::from_slice::<Response>(&bytes) {
            Ok(resp) => Some(resp),
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(fingerprint = fp.short(), error=%err, "undecodable cache entry, treating as miss");
                None
            }
        }
    }

    pub async fn store(&self, fp: &Fingerprint, resp: &Response) {
        let bytes = match serde_json::to_vec(resp) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(fingerprint = fp.short(), error=%err, "failed to encode response for cache");
                return;
            }
        };

        match self.store.put(fp.as_str(), bytes, self.ttl).await {
            Ok(()) => debug!(fingerprint = fp.short(), ttl_ms = self.ttl.as_millis() as u64, "response cached"),
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    fingerprint = fp.short(),
                    backend = self.store.backend(),
                    error=%err,
                    "cache unavailable, response not stored"
                );
            }
        }
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn reset_errors(&self) {
        self.errors.store(0, Ordering::Relaxed);
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }
}
