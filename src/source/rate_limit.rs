//! Token-bucket rate limiter for outbound requests.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Refills continuously at `rate_per_minute`; holds at most `capacity`
/// tokens so idle periods only allow a short burst.
pub struct TokenBucket {
    capacity: f64,
    per_second: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn per_minute(rate_per_minute: u32) -> Self {
        let rate = rate_per_minute.max(1) as f64;
        let capacity = (rate / 10.0).floor().max(1.0);
        Self {
            capacity,
            per_second: rate / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.per_second).min(self.capacity);
        state.last_refill = now;
    }

    /// Take a token, or report how long until one is available.
    pub async fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(missing / self.per_second))
        }
    }

    /// Take a token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire().await {
                Ok(()) => return,
                Err(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_retry_after() {
        let bucket = TokenBucket::per_minute(60);
        // capacity = max(1, 60/10) = 6
        for _ in 0..6 {
            assert!(bucket.try_acquire().await.is_ok());
        }
        let wait = bucket.try_acquire().await.unwrap_err();
        assert!(wait <= Duration::from_secs(1));
        assert!(wait > Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let bucket = TokenBucket::per_minute(6);
        bucket.acquire().await;
        let start = Instant::now();
        bucket.acquire().await;
        // 6/min refills one token every 10s.
        assert!(start.elapsed() >= Duration::from_secs(9));
    }
}
