//! Execution-wide send pacing.
//!
//! One token bucket is shared by every recipient task of an execution.
//! The bucket starts empty and refills continuously at the configured
//! hourly rate, so the k-th send completes no earlier than k tokens'
//! worth of elapsed time. Capacity bounds the burst that can accumulate
//! while dispatch is stalled, e.g. overnight with the window closed.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Tokens are tracked in thousandths for sub-token refill precision.
const SCALE: u64 = 1000;
const MILLIS_PER_HOUR: u64 = 3_600_000;

pub struct TokenBucket {
    rate_per_hour: u64,
    /// Maximum accumulation, in millitokens
    capacity: u64,
    state: Mutex<BucketState>,
}

struct BucketState {
    millitokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_hour: u32, capacity_tokens: u32) -> Self {
        Self {
            rate_per_hour: u64::from(rate_per_hour.max(1)),
            capacity: u64::from(capacity_tokens.max(1)) * SCALE,
            state: Mutex::new(BucketState {
                millitokens: 0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until the refill produces it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.millitokens >= SCALE {
                    state.millitokens -= SCALE;
                    return;
                }
                let deficit = SCALE - state.millitokens;
                let per_ms = self.rate_per_hour * SCALE;
                // Round up so we never wake before the token exists.
                let millis = (deficit * MILLIS_PER_HOUR + per_ms - 1) / per_ms;
                Duration::from_millis(millis.max(1))
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Take one token only if it is already available.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.millitokens >= SCALE {
            state.millitokens -= SCALE;
            true
        } else {
            false
        }
    }

    /// Credit tokens for the time elapsed since the last refill. The
    /// timestamp only advances when at least one millitoken was credited,
    /// otherwise short slices would round to zero forever.
    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed_millis = now.duration_since(state.last_refill).as_millis() as u64;
        if elapsed_millis == 0 {
            return;
        }

        let credit = elapsed_millis
            .saturating_mul(self.rate_per_hour)
            .saturating_mul(SCALE)
            / MILLIS_PER_HOUR;
        if credit > 0 {
            state.millitokens = state.millitokens.saturating_add(credit).min(self.capacity);
            state.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_bucket_starts_empty() {
        let bucket = TokenBucket::new(3600, 10);
        assert!(!bucket.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_first_token() {
        // 3600/hour is one token per second.
        let bucket = TokenBucket::new(3600, 10);
        let start = Instant::now();

        bucket.acquire().await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1100), "took {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_acquires_match_the_rate() {
        // 600/hour is one token per six seconds; ten tokens need a minute.
        let bucket = TokenBucket::new(600, 10);
        let start = Instant::now();

        for _ in 0..10 {
            bucket.acquire().await;
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(60), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(61), "took {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_capacity() {
        let bucket = TokenBucket::new(3600, 5);

        // A long stall may only bank `capacity` tokens.
        tokio::time::sleep(Duration::from_secs(600)).await;

        for _ in 0..5 {
            assert!(bucket.try_acquire().await);
        }
        assert!(!bucket.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquirers_share_the_budget() {
        let bucket = Arc::new(TokenBucket::new(3600, 10));
        let start = Instant::now();
        let mut handles = Vec::new();

        for _ in 0..4 {
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    bucket.acquire().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 20 tokens at one per second, shared, not per task.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(20), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(22), "took {:?}", elapsed);
    }
}
