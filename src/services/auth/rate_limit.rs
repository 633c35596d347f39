//! Sliding-window request limiter, keyed by caller-chosen identifier.
//!
//! Best-effort abuse mitigation, not a security boundary; state does not
//! survive a restart.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    limit: usize,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            window,
            limit,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a request for `id` is within limits. A denied call is not
    /// recorded; an unknown id starts from zero.
    pub async fn allow(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;

        // Lazy expiry across the whole map, so identifiers never seen again
        // do not pin their entries forever.
        hits.retain(|_, times| {
            while times
                .front()
                .is_some_and(|&front| now.duration_since(front) > self.window)
            {
                times.pop_front();
            }
            !times.is_empty()
        });

        if self.limit == 0 {
            return false;
        }

        let times = hits.entry(id.to_string()).or_default();
        if times.len() >= self.limit {
            return false;
        }
        times.push_back(now);
        true
    }

    #[cfg(test)]
    async fn tracked_identifiers(&self) -> usize {
        self.hits.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limit_plus_one_calls_yield_one_denial() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));

        let mut denied = 0;
        for _ in 0..4 {
            if !limiter.allow("dev-1").await {
                denied += 1;
            }
        }
        assert_eq!(denied, 1);

        // Another identifier is unaffected.
        assert!(limiter.allow("dev-2").await);
    }

    #[tokio::test]
    async fn window_expiry_frees_the_identifier() {
        let limiter = RateLimiter::new(1, Duration::from_millis(30));

        assert!(limiter.allow("dev").await);
        assert!(!limiter.allow("dev").await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.allow("dev").await);
    }

    #[tokio::test]
    async fn drained_identifiers_are_swept_from_the_map() {
        let limiter = RateLimiter::new(2, Duration::from_millis(20));

        assert!(limiter.allow("gone-1").await);
        assert!(limiter.allow("gone-2").await);
        assert_eq!(limiter.tracked_identifiers().await, 2);

        tokio::time::sleep(Duration::from_millis(50)).await;

        // The next call, whoever it is for, sweeps the stale entries.
        assert!(limiter.allow("fresh").await);
        assert_eq!(limiter.tracked_identifiers().await, 1);
    }
}
