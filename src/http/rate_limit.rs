//! Token bucket limiter stage.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use super::request::{Fetch, HttpRequest, HttpResponse, SharedFetch};
use crate::error::{ConfidenceError, ErrorCode, Result};

/// Bucket size options for [`FetchBuilder::rate_limit`](super::FetchBuilder::rate_limit).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitOptions {
    /// Refill stops at this many tokens.
    pub max_tokens: f64,
    /// Tokens available at start. May exceed `max_tokens` for an initial burst.
    pub initial_tokens: f64,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1.0,
            initial_tokens: 1.0,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, fill_rate: f64, max_tokens: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        if self.tokens < max_tokens && fill_rate > 0.0 {
            self.tokens = (self.tokens + elapsed * fill_rate).min(max_tokens);
        }
    }
}

pub(crate) struct RateLimit {
    inner: SharedFetch,
    fill_rate: f64,
    max_tokens: f64,
    // tokio's Mutex queues lockers in FIFO order; holding it across the wait
    // serializes every caller through one queue.
    bucket: Mutex<Bucket>,
}

impl RateLimit {
    pub(crate) fn new(inner: SharedFetch, fill_rate: f64, options: RateLimitOptions) -> Self {
        if fill_rate.is_nan() || fill_rate <= 0.0 {
            tracing::warn!(
                "Rate limit fill rate {} never refills, calls fail once the initial tokens are spent",
                fill_rate
            );
        }
        Self {
            inner,
            fill_rate,
            max_tokens: options.max_tokens,
            bucket: Mutex::new(Bucket {
                tokens: options.initial_tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    async fn acquire(&self, signal: &CancellationToken) -> Result<()> {
        let mut bucket = tokio::select! {
            _ = signal.cancelled() => return Err(ConfidenceError::cancelled()),
            bucket = self.bucket.lock() => bucket,
        };

        bucket.refill(self.fill_rate, self.max_tokens);
        if bucket.tokens < 1.0 {
            let wait = Duration::try_from_secs_f64((1.0 - bucket.tokens) / self.fill_rate)
                .map_err(|_| {
                    ConfidenceError::new(
                        ErrorCode::CapacityExceeded,
                        format!("Rate limit exhausted, fill rate {} never refills", self.fill_rate),
                    )
                })?;
            tracing::debug!("Rate limit reached, waiting {:?} for a token", wait);
            tokio::select! {
                _ = signal.cancelled() => return Err(ConfidenceError::cancelled()),
                _ = sleep(wait) => {}
            }
            bucket.refill(self.fill_rate, self.max_tokens);
            bucket.tokens = bucket.tokens.max(1.0);
        }
        bucket.tokens -= 1.0;
        Ok(())
    }
}

#[async_trait]
impl Fetch for RateLimit {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.acquire(request.signal()).await?;
        self.inner.fetch(request).await
    }
}
