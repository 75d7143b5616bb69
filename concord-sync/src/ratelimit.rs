//! Fixed-window rate limiter.
//!
//! The first call for a key opens a window; each call in the window bumps
//! the counter, and once the counter passes `limit` calls are refused until
//! the window ends.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::MAX_DURATION_SECS;
use crate::time::Clock;

/// Result of [`RateLimiter::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// Calls still allowed in the current window.
    pub remaining: u32,
    /// Seconds until the window resets (rounded up).
    pub reset_secs: u64,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: DateTime<Utc>,
    length: Duration,
    count: u32,
}

impl Window {
    fn ends(&self) -> DateTime<Utc> {
        self.started + self.length
    }
}

pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Count one call against `key` and decide whether it is allowed.
    pub async fn admit(&self, key: &str, limit: u32, window_secs: u64) -> Admission {
        let now = self.clock.now();
        let length = Duration::seconds(window_secs.clamp(1, MAX_DURATION_SECS) as i64);
        let mut windows = self.windows.lock().await;

        let window = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            length,
            count: 0,
        });
        if now >= window.ends() {
            *window = Window {
                started: now,
                length,
                count: 0,
            };
        }
        window.count = window.count.saturating_add(1);

        let allowed = window.count <= limit;
        let remaining = limit.saturating_sub(window.count);
        let reset_secs = ceil_secs(window.ends() - now);
        if !allowed {
            log::warn!("Rate limit exceeded for {key}: {} calls, limit {limit}", window.count);
        }
        Admission {
            allowed,
            remaining,
            reset_secs,
        }
    }

    /// Drop windows that have ended. Returns how many were removed.
    pub async fn prune(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, w| now < w.ends());
        before - windows.len()
    }

    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.len()
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let ms = d.num_milliseconds().max(0) as u64;
    ms.div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn limiter() -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = RateLimiter::new(clock.clone());
        (clock, limiter)
    }

    #[tokio::test]
    async fn test_sixth_call_rejected_then_window_resets() {
        let (clock, limiter) = limiter();
        for i in 0..5 {
            let a = limiter.admit("k", 5, 60).await;
            assert!(a.allowed, "call {i} should be allowed");
            assert_eq!(a.remaining, 4 - i);
        }
        let sixth = limiter.admit("k", 5, 60).await;
        assert!(!sixth.allowed);
        assert_eq!(sixth.remaining, 0);
        assert_eq!(sixth.reset_secs, 60);

        clock.advance(Duration::seconds(61));
        let after = limiter.admit("k", 5, 60).await;
        assert!(after.allowed);
        assert_eq!(after.remaining, 4);
    }

    #[tokio::test]
    async fn test_huge_window_is_clamped() {
        let (_clock, limiter) = limiter();
        let a = limiter.admit("k", 1, u64::MAX).await;
        assert!(a.allowed);
        assert_eq!(a.reset_secs, MAX_DURATION_SECS);
        assert_eq!(limiter.prune().await, 0);
    }

    #[tokio::test]
    async fn test_reset_hint_counts_down() {
        let (clock, limiter) = limiter();
        limiter.admit("k", 1, 60).await;
        clock.advance(Duration::milliseconds(10_500));
        let a = limiter.admit("k", 1, 60).await;
        assert!(!a.allowed);
        assert_eq!(a.reset_secs, 50);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (_clock, limiter) = limiter();
        assert!(limiter.admit("a", 1, 60).await.allowed);
        assert!(!limiter.admit("a", 1, 60).await.allowed);
        assert!(limiter.admit("b", 1, 60).await.allowed);
    }

    #[tokio::test]
    async fn test_prune_drops_expired_windows() {
        let (clock, limiter) = limiter();
        limiter.admit("a", 1, 10).await;
        limiter.admit("b", 1, 120).await;
        clock.advance(Duration::seconds(30));
        assert_eq!(limiter.prune().await, 1);
        assert_eq!(limiter.tracked_keys().await, 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_admits_exactly_limit_per_window(limit in 1u32..40, calls in 0u32..100) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (clock, limiter) = limiter();
            let admitted = rt.block_on(async {
                let mut admitted = 0;
                for _ in 0..calls {
                    if limiter.admit("k", limit, 60).await.allowed {
                        admitted += 1;
                    }
                }
                admitted
            });
            proptest::prop_assert_eq!(admitted, calls.min(limit));

            clock.advance(Duration::seconds(60));
            let fresh = rt.block_on(limiter.admit("k", limit, 60));
            proptest::prop_assert!(fresh.allowed);
        }
    }
}
