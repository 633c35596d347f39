//! Cache client interface used by the replay guard.
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-layer errors (transport/command).
///
/// Kept independent from `AppError` so callers decide how to fail
/// (the replay guard fails closed).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    BackendConnection(String),
    #[error("cache command error: {0}")]
    BackendCommand(String),
}

/// A minimal cache interface.
///
/// Anti-replay only needs an atomic `SET NX` with TTL; keep the surface
/// that small.
#[async_trait]
pub trait CacheClient: Send + Sync {
    // Backend name for logging.
    fn backend_name(&self) -> &'static str;

    // Set value if the key does not exist, with TTL.
    //
    // Returns:
    // - `Ok(true)`  if the key was set (not seen before)
    // - `Ok(false)` if the key already exists
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> CacheResult<bool>;
}
