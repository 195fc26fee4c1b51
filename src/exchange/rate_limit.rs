//! Token-bucket rate limiting for venue requests.
//!
//! Two tiers: a local per-second bucket sized for normal operation and a
//! conservative fallback bucket that caps sustained throughput the way venue
//! weight limits do. A request must take a token from both.

use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

/// Two-tier token bucket shared by all requests of one client.
pub struct RateLimiter {
    local: Mutex<Bucket>,
    fallback: Mutex<Bucket>,
}

impl RateLimiter {
    /// `local_per_sec` requests per second burst-capped at `local_burst`;
    /// `fallback_per_min` caps the sustained request rate.
    pub fn new(local_per_sec: f64, local_burst: f64, fallback_per_min: f64) -> Self {
        Self {
            local: Mutex::new(Bucket::new(local_burst, local_per_sec)),
            fallback: Mutex::new(Bucket::new(fallback_per_min, fallback_per_min / 60.0)),
        }
    }

    /// Defaults sized for Binance futures REST weight limits.
    pub fn default_tiers() -> Self {
        Self::new(10.0, 20.0, 1200.0)
    }

    /// Wait until a request is allowed. Bounded: the wait is the refill time
    /// of the emptier bucket.
    pub async fn acquire(&self) {
        loop {
            let now = Instant::now();
            let local_wait = self.local.lock().await.try_acquire(now).err();
            if local_wait.is_none() {
                match self.fallback.lock().await.try_acquire(now) {
                    Ok(()) => return,
                    Err(wait) => {
                        debug!(wait_ms = wait.as_millis() as u64, "fallback rate tier full");
                        tokio::time::sleep(wait).await;
                    }
                }
            } else if let Some(wait) = local_wait {
                tokio::time::sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_drains_and_refills() {
        let start = Instant::now();
        let mut bucket = Bucket::new(2.0, 1.0);

        assert!(bucket.try_acquire(start).is_ok());
        assert!(bucket.try_acquire(start).is_ok());
        let wait = bucket.try_acquire(start).unwrap_err();
        assert!(wait > Duration::from_millis(900) && wait <= Duration::from_secs(1));

        // One second later a token is back
        assert!(bucket.try_acquire(start + Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let start = Instant::now();
        let mut bucket = Bucket::new(2.0, 1.0);
        bucket.refill(start + Duration::from_secs(100));
        assert!(bucket.tokens <= 2.0);
    }

    #[tokio::test]
    async fn test_acquire_allows_burst() {
        let limiter = RateLimiter::new(100.0, 5.0, 1000.0);
        for _ in 0..5 {
            limiter.acquire().await;
        }
    }
}
