use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::error::FetchError;

/// Per chain handle spacing out remote calls and bounding how long each may take.
///
/// Clones share the same bucket, so every fetch done against one chain draws from it.
#[derive(Clone)]
pub struct RpcLimiter {
    bucket: Option<Arc<Mutex<Bucket>>>,
    timeout: Duration,
}

struct Bucket {
    request_interval: Duration, // min delay between calls
    max_tokens: u32,
    tokens: u32,
    last_update: Instant,
}

impl Bucket {
    fn new(request_interval: Duration, max_tokens: u32, now: Instant) -> Self {
        Self {
            request_interval,
            max_tokens,
            tokens: max_tokens,
            last_update: now,
        }
    }

    fn update(&mut self, now: Instant) {
        let elapsed = now - self.last_update;
        let tokens_to_add = elapsed.as_nanos() / self.request_interval.as_nanos();
        if tokens_to_add <= u32::MAX as u128 {
            self.last_update += self.request_interval * (tokens_to_add as u32);
            self.tokens = self
                .tokens
                .saturating_add(tokens_to_add as u32)
                .min(self.max_tokens);
        } else {
            self.last_update = now;
            self.tokens = self.max_tokens;
        }
    }

    fn take(&mut self) -> bool {
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    fn until_next_token(&self, now: Instant) -> Duration {
        let next_update = self.last_update + self.request_interval;
        next_update.saturating_duration_since(now)
    }
}

impl RpcLimiter {
    /// `burst` calls may happen back to back, after that calls are spaced by `min_delay`.
    pub fn new(min_delay: Duration, burst: u32, timeout: Duration) -> Self {
        let bucket = (!min_delay.is_zero())
            .then(|| Arc::new(Mutex::new(Bucket::new(min_delay, burst.max(1), Instant::now()))));
        Self { bucket, timeout }
    }

    pub fn unlimited(timeout: Duration) -> Self {
        Self {
            bucket: None,
            timeout,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    /// Waits for the next free slot.
    pub async fn acquire(&self) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        loop {
            let wait = {
                let mut bucket = bucket.lock();
                let now = Instant::now();
                bucket.update(now);
                if bucket.take() {
                    return;
                }
                bucket.until_next_token(now)
            };
            trace!("Rate limited for {wait:?}");
            tokio::time::sleep(wait).await;
        }
    }

    /// Runs one remote call once a slot is free. Running out of time is a fetch failure.
    pub async fn call<T, F>(&self, method: &str, call: F) -> Result<T, FetchError>
    where
        F: Future<Output = Result<T, FetchError>>,
    {
        self.acquire().await;
        trace!(method, "Calling remote source");
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        }
    }
}
