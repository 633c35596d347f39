//! Anti-replay guard for DPoP proofs.
//!
//! One atomic insert-if-absent per `jti`; when two proofs race on the same
//! key the cache backend decides, exactly one wins. Backend failure is an
//! error (fail closed), never a pass.

use std::sync::Arc;
use std::time::Duration;

use crate::services::cache::{CacheClient, CacheError};

pub struct ReplayStore {
    cache: Arc<dyn CacheClient>,
    // Key prefix to avoid collisions across environments.
    prefix: String,
}

impl ReplayStore {
    pub fn new(cache: Arc<dyn CacheClient>, prefix: impl Into<String>) -> Self {
        Self {
            cache,
            prefix: prefix.into(),
        }
    }

    /// Returns:
    /// - `Ok(true)`  first sighting (stored)
    /// - `Ok(false)` replay (key already present)
    /// - `Err(_)`    backend failure; callers must deny the request
    pub async fn check_and_store(&self, jti: &str, ttl: Duration) -> Result<bool, CacheError> {
        let key = format!("{}:{}", self.prefix, jti);
        self.cache.set_if_absent_with_ttl(&key, "1", ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::MemoryCache;

    #[tokio::test]
    async fn same_jti_is_stored_once() {
        let store = ReplayStore::new(Arc::new(MemoryCache::new()), "dpop:jti");
        let ttl = Duration::from_secs(900);

        assert!(store.check_and_store("abc", ttl).await.unwrap());
        assert!(!store.check_and_store("abc", ttl).await.unwrap());
        assert!(store.check_and_store("def", ttl).await.unwrap());
    }
}
