//! Per-client fixed-window rate limiting.
//!
//! Every `(client address, request class)` pair owns one bucket holding the
//! start of its current window and the number of requests admitted in it.
//! Buckets live in a [`DashMap`], so two clients only contend when they
//! hash to the same shard, and a burst from one client never serialises
//! requests from everybody else.
//!
//! ```text
//!  window_start            window_start + window
//!       │ req ✓  req ✗  req ✗       │ req ✓ …
//!       └───────────────────────────┴──────────▶ time
//! ```

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Request classes are limited independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestClass {
    Page,
    Image,
}

impl fmt::Display for RequestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestClass::Page => "page",
            RequestClass::Image => "image",
        })
    }
}

/// State for one `(client, class)` pair.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitBucket {
    pub client: IpAddr,
    pub class: RequestClass,
    pub window_start: Instant,
    pub count: u32,
}

/// Limits applied to one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassLimit {
    pub max_requests: u32,
    pub window: Duration,
}

/// Fixed-window limiter shared by all request handlers.
#[derive(Debug)]
pub struct RateLimiter {
    page: ClassLimit,
    image: ClassLimit,
    idle_ttl: Duration,
    buckets: DashMap<(IpAddr, RequestClass), RateLimitBucket>,
}

impl RateLimiter {
    pub fn new(page: ClassLimit, image: ClassLimit, idle_ttl: Duration) -> Self {
        Self {
            page,
            image,
            idle_ttl,
            buckets: DashMap::new(),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        let window = config.rate_window();
        Self::new(
            ClassLimit {
                max_requests: config.page_rate_limit,
                window,
            },
            ClassLimit {
                max_requests: config.image_rate_limit,
                window,
            },
            config.bucket_idle_ttl(),
        )
    }

    pub fn limit_for(&self, class: RequestClass) -> ClassLimit {
        match class {
            RequestClass::Page => self.page,
            RequestClass::Image => self.image,
        }
    }

    /// Admit or reject one request arriving now.
    pub fn check(&self, client: IpAddr, class: RequestClass) -> Result<(), ProxyError> {
        self.check_at(client, class, Instant::now())
    }

    /// Admit or reject one request arriving at `now`.
    ///
    /// The shard lock for this bucket is held only for the duration of the
    /// counter update.
    pub fn check_at(
        &self,
        client: IpAddr,
        class: RequestClass,
        now: Instant,
    ) -> Result<(), ProxyError> {
        let limit = self.limit_for(class);
        let mut bucket = self
            .buckets
            .entry((client, class))
            .or_insert_with(|| RateLimitBucket {
                client,
                class,
                window_start: now,
                count: 0,
            });

        let elapsed = now.saturating_duration_since(bucket.window_start);
        if elapsed >= limit.window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        if bucket.count >= limit.max_requests {
            let retry_after = limit.window.saturating_sub(elapsed);
            trace!(%client, %class, count = bucket.count, "rate limited");
            return Err(ProxyError::RateLimitExceeded {
                class,
                retry_after_ms: (retry_after.as_millis() as u64).max(1),
            });
        }

        bucket.count += 1;
        Ok(())
    }

    /// Drop buckets whose window started more than the idle TTL ago.
    ///
    /// Returns the number of buckets removed.
    pub fn purge_idle(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, b| {
            now.saturating_duration_since(b.window_start) < self.idle_ttl.max(self.limit_for(b.class).window)
        });
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!("Purged {} idle rate-limit buckets", removed);
        }
        removed
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Start the background task that purges idle buckets every `every`.
    pub fn spawn_purger(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                self.purge_idle(Instant::now());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn limiter() -> RateLimiter {
        RateLimiter::new(
            ClassLimit {
                max_requests: 1,
                window: Duration::from_secs(1),
            },
            ClassLimit {
                max_requests: 5,
                window: Duration::from_secs(1),
            },
            Duration::from_secs(60),
        )
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn second_page_in_same_window_is_rejected() {
        let rl = limiter();
        let t0 = Instant::now();
        assert!(rl.check_at(ip(1), RequestClass::Page, t0).is_ok());
        let err = rl
            .check_at(ip(1), RequestClass::Page, t0 + Duration::from_millis(300))
            .unwrap_err();
        match err {
            ProxyError::RateLimitExceeded {
                class,
                retry_after_ms,
            } => {
                assert_eq!(class, RequestClass::Page);
                assert_eq!(retry_after_ms, 700);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn window_rollover_admits_again() {
        let rl = limiter();
        let t0 = Instant::now();
        rl.check_at(ip(1), RequestClass::Page, t0).unwrap();
        assert!(rl
            .check_at(ip(1), RequestClass::Page, t0 + Duration::from_millis(999))
            .is_err());
        assert!(rl
            .check_at(ip(1), RequestClass::Page, t0 + Duration::from_secs(1))
            .is_ok());
    }

    #[test]
    fn classes_and_clients_are_independent() {
        let rl = limiter();
        let t0 = Instant::now();
        rl.check_at(ip(1), RequestClass::Page, t0).unwrap();
        assert!(rl.check_at(ip(2), RequestClass::Page, t0).is_ok());
        for _ in 0..5 {
            rl.check_at(ip(1), RequestClass::Image, t0).unwrap();
        }
        assert!(rl.check_at(ip(1), RequestClass::Image, t0).is_err());
    }

    #[test]
    fn purge_drops_only_idle_buckets() {
        let rl = limiter();
        let t0 = Instant::now();
        rl.check_at(ip(1), RequestClass::Page, t0).unwrap();
        rl.check_at(ip(2), RequestClass::Page, t0 + Duration::from_secs(50))
            .unwrap();
        assert_eq!(rl.purge_idle(t0 + Duration::from_secs(61)), 1);
        assert_eq!(rl.len(), 1);
    }

    #[test]
    fn concurrent_checks_never_over_admit() {
        let rl = Arc::new(RateLimiter::new(
            ClassLimit {
                max_requests: 3,
                window: Duration::from_secs(60),
            },
            ClassLimit {
                max_requests: 5,
                window: Duration::from_secs(60),
            },
            Duration::from_secs(60),
        ));
        let t0 = Instant::now();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let rl = Arc::clone(&rl);
                std::thread::spawn(move || rl.check_at(ip(9), RequestClass::Page, t0).is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 3);
    }
}
