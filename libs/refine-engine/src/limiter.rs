//! Token-bucket rate limiter shared by every concurrent gateway caller.
//!
//! The bucket state has a single owner (a mutex); admit and refill happen
//! under the same lock, so concurrent pipelines cannot collectively exceed
//! the configured requests-per-minute ceiling. Callers that find the bucket
//! empty sleep until the next token is due instead of being rejected.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(60);
/// Floor on a single wait so float rounding cannot spin on a zero sleep
const MIN_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter admitting `requests_per_minute` calls per rolling minute.
    ///
    /// The bucket starts full, so a burst of `requests_per_minute` calls is
    /// admitted immediately. Zero is clamped to one.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let capacity = f64::from(requests_per_minute.max(1));
        Self {
            capacity,
            refill_rate: capacity / WINDOW.as_secs_f64(),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until one request may be issued, then consume it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }

                let missing = 1.0 - bucket.tokens;
                Duration::from_secs_f64(missing / self.refill_rate).max(MIN_WAIT)
            };

            debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting for capacity");
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available (fractional)
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_capacity_is_immediate() {
        let limiter = RateLimiter::per_minute(60);
        let start = Instant::now();
        for _ in 0..60 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_over_limit_is_delayed_not_rejected() {
        let limiter = RateLimiter::per_minute(60);
        let start = Instant::now();
        for _ in 0..61 {
            limiter.acquire().await;
        }
        // One token refills every second at 60 rpm
        assert!(start.elapsed() >= Duration::from_millis(999));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_the_ceiling() {
        let limiter = Arc::new(RateLimiter::per_minute(10));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    limiter.acquire().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 20 calls at 10/min: 10 from the initial burst, 10 more at 6s intervals
        assert!(start.elapsed() >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped_at_capacity() {
        let limiter = RateLimiter::per_minute(5);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!((limiter.available().await - 5.0).abs() < 1e-9);
    }
}
