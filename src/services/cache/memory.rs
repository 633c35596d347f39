use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::services::cache::client::{CacheClient, CacheResult};

/// In-process cache. Fallback when no Valkey URL is configured, and the
/// backend used by tests. Single-use guarantees hold within one process
/// only.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Instant>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheClient for MemoryCache {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        _value: &str,
        ttl: Duration,
    ) -> CacheResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("cache lock poisoned");

        // Lazy expiry: drop dead entries as we touch the map.
        entries.retain(|_, expiry| *expiry > now);

        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), now + ttl);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_insert_of_same_key_is_rejected() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);

        assert!(cache.set_if_absent_with_ttl("k1", "1", ttl).await.unwrap());
        assert!(!cache.set_if_absent_with_ttl("k1", "1", ttl).await.unwrap());
        assert!(cache.set_if_absent_with_ttl("k2", "1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_key_can_be_set_again() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_millis(20);

        assert!(cache.set_if_absent_with_ttl("k", "1", ttl).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.set_if_absent_with_ttl("k", "1", ttl).await.unwrap());
    }
}
