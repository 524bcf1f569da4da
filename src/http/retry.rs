//! Retry with exponential backoff and jitter.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;

use super::request::{Fetch, HttpRequest, HttpResponse, SharedFetch};
use crate::error::{ConfidenceError, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt. Default: 3
    pub max_retries: u32,

    /// Delay before the first retry. Default: 1s
    pub delay: Duration,

    /// Multiplier applied per retry. Default: 2.0
    pub backoff: f64,

    /// Cap on any single delay, before jitter. Default: 30s
    pub max_delay: Duration,

    /// Fraction of the delay randomly added or removed. Default: 0.1
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(1),
            backoff: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// `min(max_delay, delay * backoff^(attempt - 1))`, scaled by a random
    /// factor in `[1 - jitter, 1 + jitter)`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponential = self.delay.as_secs_f64() * self.backoff.powi((attempt - 1).min(1024) as i32);
        let capped = exponential.min(self.max_delay.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0) * (2.0 * rand::random::<f64>() - 1.0);

        Duration::try_from_secs_f64((capped * (1.0 + jitter)).max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// Builder for RetryConfig.
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    max_retries: Option<u32>,
    delay: Option<Duration>,
    backoff: Option<f64>,
    max_delay: Option<Duration>,
    jitter: Option<f64>,
}

impl RetryConfigBuilder {
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn backoff(mut self, backoff: f64) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn build(self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            delay: self.delay.unwrap_or(defaults.delay),
            backoff: self.backoff.unwrap_or(defaults.backoff),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}

pub(crate) struct Retry {
    inner: SharedFetch,
    config: RetryConfig,
}

impl Retry {
    pub(crate) fn new(inner: SharedFetch, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl Fetch for Retry {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        let signal = request.signal().clone();
        let mut attempt = 0;

        loop {
            if signal.is_cancelled() {
                return Err(ConfidenceError::cancelled());
            }

            let error = match self.inner.fetch(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if attempt >= self.config.max_retries || !error.is_retryable() {
                return Err(error);
            }
            if signal.is_cancelled() {
                return Err(ConfidenceError::cancelled());
            }

            attempt += 1;
            let delay = self.config.calculate_delay(attempt);
            tracing::debug!(
                "Retry attempt {} of {} for {} after {}, waiting {:?}",
                attempt,
                self.config.max_retries,
                request.url,
                error,
                delay
            );

            tokio::select! {
                _ = signal.cancelled() => return Err(ConfidenceError::cancelled()),
                _ = sleep(delay) => {}
            }
        }
    }
}
