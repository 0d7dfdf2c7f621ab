//! Token-bucket rate limiter for dispatch hand-off.
//!
//! The bucket holds at most `max(1, rate)` tokens and refills continuously
//! at `rate` tokens per second. It starts with a single token so a burst
//! right after startup is still paced.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens per second; `None` means unlimited.
    rate: Option<f64>,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// A non-positive or non-finite rate disables limiting.
    pub fn new(permits_per_sec: f64) -> Self {
        let rate = (permits_per_sec.is_finite() && permits_per_sec > 0.0).then_some(permits_per_sec);
        Self {
            rate,
            capacity: permits_per_sec.max(1.0),
            bucket: Mutex::new(Bucket {
                tokens: 1.0,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate.is_none()
    }

    fn refill(&self, bucket: &mut Bucket, rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Wait until a permit is available and take it.
    pub async fn acquire(&self) {
        let Some(rate) = self.rate else {
            return;
        };
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket, rate);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a permit if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let Some(rate) = self.rate else {
            return true;
        };
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket, rate);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
