//! Per-IP sliding-window rate limiting for inbound connections

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding one-minute window per remote IP. The capacity is passed per
/// call so a live config change applies immediately.
pub struct RateLimiter {
    requests: RwLock<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
        }
    }

    /// Record a connection attempt and report whether it is allowed.
    /// Limit 0 means unlimited.
    pub async fn allow(&self, ip: &str, limit: i64) -> bool {
        if limit <= 0 {
            return true;
        }

        let now = Instant::now();
        let mut requests = self.requests.write().await;
        let entry = requests.entry(ip.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < WINDOW);

        if entry.len() >= limit as usize {
            return false;
        }
        entry.push(now);
        true
    }

    /// Drop window entries that have fully expired.
    pub async fn prune(&self) {
        let now = Instant::now();
        let mut requests = self.requests.write().await;
        requests.retain(|_, times| {
            times.retain(|t| now.duration_since(*t) < WINDOW);
            !times.is_empty()
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn third_connection_is_rejected() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("1.2.3.4", 2).await);
        assert!(limiter.allow("1.2.3.4", 2).await);
        assert!(!limiter.allow("1.2.3.4", 2).await);
        // Other IPs keep their own window.
        assert!(limiter.allow("5.6.7.8", 2).await);
    }

    #[tokio::test]
    async fn zero_limit_is_unlimited() {
        let limiter = RateLimiter::new();
        for _ in 0..100 {
            assert!(limiter.allow("1.2.3.4", 0).await);
        }
    }

    #[tokio::test]
    async fn prune_clears_empty_entries() {
        let limiter = RateLimiter::new();
        limiter.allow("1.2.3.4", 5).await;
        limiter.prune().await;
        assert_eq!(limiter.requests.read().await.len(), 1);
    }
}
