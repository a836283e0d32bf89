use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Token-bucket limiter for outbound calls to the target API.
///
/// The bucket starts full at `burst` and refills at `rate` tokens per
/// second. [`RateLimiter::acquire`] suspends until a token is available;
/// dropping the returned future (request cancelled) gives up the slot
/// without consuming a token.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    refilled: Instant,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: rate.max(f64::MIN_POSITIVE),
            burst,
            state: Mutex::new(Bucket {
                tokens: burst,
                refilled: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.state.lock().expect("rate limiter lock poisoned");
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.refilled).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
                bucket.refilled = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };

            tokio::time::sleep(wait).await;
        }
    }
}
