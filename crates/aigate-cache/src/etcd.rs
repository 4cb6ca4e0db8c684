use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use etcd_client::{Client, PutOptions};
use tokio::sync::Mutex;

use crate::types::CacheStore;

pub const DEFAULT_PREFIX: &str = "/aigate/cache/";

/// Cache store backed by etcd. TTLs are enforced with leases.
#[derive(Clone)]
pub struct EtcdCacheStore {
    client: Arc<Mutex<Client>>,
    prefix: String,
}

impl EtcdCacheStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        Self::connect_with_prefix(endpoints, DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(endpoints: &[String], prefix: &str) -> Result<Self> {
        let c = Client::connect(endpoints, None).await?;
        tracing::info!(?endpoints, prefix, "connected to etcd cache store");
        Ok(Self {
            client: Arc::new(Mutex::new(c)),
            prefix: prefix.to_string(),
        })
    }

    fn ttl_to_seconds(ttl: Duration) -> i64 {
        let mut secs = (ttl.as_millis() as f64 / 1000.0).ceil() as i64;
        if secs <= 0 {
            secs = 1;
        }
        secs
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait::async_trait]
impl CacheStore for EtcdCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(self.full_key(key), None).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut cli = self.client.lock().await;
        let lease = cli.lease_grant(Self::ttl_to_seconds(ttl), None).await?;
        let opts = PutOptions::new().with_lease(lease.id());
        cli.put(self.full_key(key), value, Some(opts)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut cli = self.client.lock().await;
        let resp = cli.delete(self.full_key(key), None).await?;
        Ok(resp.deleted() > 0)
    }

    fn backend(&self) -> &'static str {
        "etcd"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_rounds_up_to_whole_seconds() {
        assert_eq!(EtcdCacheStore::ttl_to_seconds(Duration::from_millis(0)), 1);
        assert_eq!(EtcdCacheStore::ttl_to_seconds(Duration::from_millis(1)), 1);
        assert_eq!(EtcdCacheStore::ttl_to_seconds(Duration::from_millis(1000)), 1);
        assert_eq!(EtcdCacheStore::ttl_to_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(EtcdCacheStore::ttl_to_seconds(Duration::from_secs(3600)), 3600);
    }
}
