use std::time::Duration;

use crate::error::{ConfidenceError, ErrorCode, Result};
use crate::http::{RateLimitOptions, RetryConfig};

pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_APPLY_DEBOUNCE: Duration = Duration::from_millis(10);
pub const DEFAULT_APPLY_MAX_BUFFER_SIZE: usize = 100;
pub const DEFAULT_APPLY_FILL_RATE: f64 = 1.0;
pub const DEFAULT_APPLY_MAX_TOKENS: f64 = 2.0;
pub const DEFAULT_APPLY_INITIAL_TOKENS: f64 = 3.0;
pub const DEFAULT_MAX_PENDING_APPLIES: usize = 1000;
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 1000;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Hosting region of the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Region {
    #[default]
    Global,
    Eu,
    Us,
}

impl Region {
    pub fn resolver_base_url(&self) -> &'static str {
        match self {
            Region::Global => "https://resolver.confidence.dev",
            Region::Eu => "https://resolver.eu.confidence.dev",
            Region::Us => "https://resolver.us.confidence.dev",
        }
    }

    /// Event ingestion has no global endpoint, so `Global` uses `eu`.
    pub fn events_base_url(&self) -> &'static str {
        match self {
            Region::Global | Region::Eu => "https://events.eu.confidence.dev",
            Region::Us => "https://events.us.confidence.dev",
        }
    }
}

impl std::str::FromStr for Region {
    type Err = ConfidenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(Region::Global),
            "eu" => Ok(Region::Eu),
            "us" => Ok(Region::Us),
            other => Err(ConfidenceError::config_error(
                ErrorCode::ConfigInvalidValue,
                format!("Unknown region '{}'", other),
            )),
        }
    }
}

pub fn default_resolve_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        delay: Duration::from_millis(100),
        backoff: 2.0,
        max_delay: Duration::from_secs(1),
        jitter: 0.1,
    }
}

/// Apply retries are bounded by the apply timeout, not by a count.
pub fn default_apply_retry() -> RetryConfig {
    RetryConfig {
        max_retries: u32::MAX,
        delay: Duration::from_secs(5),
        backoff: 2.0,
        max_delay: Duration::from_secs(5 * 60),
        jitter: 0.2,
    }
}

#[derive(Debug, Clone)]
pub struct ConfidenceOptions {
    pub client_secret: String,
    pub region: Region,
    /// Overrides the region's resolver host.
    pub base_url: Option<String>,
    pub resolve_timeout: Duration,
    pub resolve_retry: RetryConfig,
    pub apply_debounce: Duration,
    pub apply_max_buffer_size: usize,
    pub apply_fill_rate: f64,
    pub apply_rate_limit: RateLimitOptions,
    pub max_pending_applies: usize,
    pub apply_timeout: Duration,
    pub apply_retry: RetryConfig,
    pub cache_max_entries: usize,
    pub cache_ttl: Option<Duration>,
    /// Ask the resolver to apply every flag at resolve time instead of on use.
    pub apply_on_resolve: bool,
    pub connect_timeout: Duration,
}

impl ConfidenceOptions {
    pub fn new(client_secret: impl Into<String>) -> Self {
        ConfidenceOptionsBuilder::new(client_secret).build()
    }

    pub fn builder(client_secret: impl Into<String>) -> ConfidenceOptionsBuilder {
        ConfidenceOptionsBuilder::new(client_secret)
    }

    pub fn resolver_base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.region.resolver_base_url())
            .trim_end_matches('/')
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_secret.trim().is_empty() {
            return Err(ConfidenceError::config_error(
                ErrorCode::ConfigInvalidSecret,
                "Client secret is required",
            ));
        }

        if let Some(base_url) = &self.base_url {
            let parsed = url::Url::parse(base_url).map_err(|e| {
                ConfidenceError::with_source(
                    ErrorCode::ConfigInvalidUrl,
                    format!("Invalid base URL '{}'", base_url),
                    e,
                )
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfidenceError::config_error(
                    ErrorCode::ConfigInvalidUrl,
                    format!("Base URL must use http or https, got '{}'", parsed.scheme()),
                ));
            }
        }

        if self.resolve_timeout.is_zero() || self.apply_timeout.is_zero() {
            return Err(ConfidenceError::config_error(
                ErrorCode::ConfigInvalidValue,
                "Timeouts must be positive",
            ));
        }

        if self.apply_max_buffer_size == 0 || self.max_pending_applies == 0 {
            return Err(ConfidenceError::config_error(
                ErrorCode::ConfigInvalidValue,
                "Apply buffer size and pending limit must be positive",
            ));
        }

        if !(self.apply_fill_rate > 0.0) || !(self.apply_rate_limit.max_tokens >= 1.0) {
            return Err(ConfidenceError::config_error(
                ErrorCode::ConfigInvalidValue,
                "Apply rate limit needs a positive fill rate and room for at least one token",
            ));
        }

        if self.cache_max_entries == 0 || self.cache_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(ConfidenceError::config_error(
                ErrorCode::ConfigInvalidValue,
                "Cache size and TTL must be positive",
            ));
        }

        Ok(())
    }
}

pub struct ConfidenceOptionsBuilder {
    client_secret: String,
    region: Region,
    base_url: Option<String>,
    resolve_timeout: Duration,
    resolve_retry: RetryConfig,
    apply_debounce: Duration,
    apply_max_buffer_size: usize,
    apply_fill_rate: f64,
    apply_rate_limit: RateLimitOptions,
    max_pending_applies: usize,
    apply_timeout: Duration,
    apply_retry: RetryConfig,
    cache_max_entries: usize,
    cache_ttl: Option<Duration>,
    apply_on_resolve: bool,
    connect_timeout: Duration,
}

impl ConfidenceOptionsBuilder {
    pub fn new(client_secret: impl Into<String>) -> Self {
        Self {
            client_secret: client_secret.into(),
            region: Region::default(),
            base_url: None,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            resolve_retry: default_resolve_retry(),
            apply_debounce: DEFAULT_APPLY_DEBOUNCE,
            apply_max_buffer_size: DEFAULT_APPLY_MAX_BUFFER_SIZE,
            apply_fill_rate: DEFAULT_APPLY_FILL_RATE,
            apply_rate_limit: RateLimitOptions {
                max_tokens: DEFAULT_APPLY_MAX_TOKENS,
                initial_tokens: DEFAULT_APPLY_INITIAL_TOKENS,
            },
            max_pending_applies: DEFAULT_MAX_PENDING_APPLIES,
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
            apply_retry: default_apply_retry(),
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            cache_ttl: None,
            apply_on_resolve: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn region(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn resolve_retry(mut self, retry: RetryConfig) -> Self {
        self.resolve_retry = retry;
        self
    }

    pub fn apply_debounce(mut self, debounce: Duration) -> Self {
        self.apply_debounce = debounce;
        self
    }

    pub fn apply_max_buffer_size(mut self, size: usize) -> Self {
        self.apply_max_buffer_size = size;
        self
    }

    pub fn apply_rate_limit(mut self, fill_rate: f64, options: RateLimitOptions) -> Self {
        self.apply_fill_rate = fill_rate;
        self.apply_rate_limit = options;
        self
    }

    pub fn max_pending_applies(mut self, max: usize) -> Self {
        self.max_pending_applies = max;
        self
    }

    pub fn apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    pub fn apply_retry(mut self, retry: RetryConfig) -> Self {
        self.apply_retry = retry;
        self
    }

    pub fn cache_max_entries(mut self, max: usize) -> Self {
        self.cache_max_entries = max;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn apply_on_resolve(mut self, enabled: bool) -> Self {
        self.apply_on_resolve = enabled;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> ConfidenceOptions {
        ConfidenceOptions {
            client_secret: self.client_secret,
            region: self.region,
            base_url: self.base_url,
            resolve_timeout: self.resolve_timeout,
            resolve_retry: self.resolve_retry,
            apply_debounce: self.apply_debounce,
            apply_max_buffer_size: self.apply_max_buffer_size,
            apply_fill_rate: self.apply_fill_rate,
            apply_rate_limit: self.apply_rate_limit,
            max_pending_applies: self.max_pending_applies,
            apply_timeout: self.apply_timeout,
            apply_retry: self.apply_retry,
            cache_max_entries: self.cache_max_entries,
            cache_ttl: self.cache_ttl,
            apply_on_resolve: self.apply_on_resolve,
            connect_timeout: self.connect_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConfidenceOptions::new("secret");
        assert_eq!(options.resolve_timeout, DEFAULT_RESOLVE_TIMEOUT);
        assert_eq!(options.apply_rate_limit.initial_tokens, 3.0);
        assert_eq!(options.resolver_base_url(), "https://resolver.confidence.dev");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_base_url_override() {
        let options = ConfidenceOptions::builder("secret")
            .region(Region::Us)
            .base_url("http://localhost:8080/")
            .build();
        assert_eq!(options.resolver_base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_global_events_use_eu() {
        assert_eq!(Region::Global.events_base_url(), Region::Eu.events_base_url());
        assert_ne!(Region::Global.resolver_base_url(), Region::Eu.resolver_base_url());
    }

    #[test]
    fn test_region_from_str() {
        assert_eq!("EU".parse::<Region>().unwrap(), Region::Eu);
        assert!("mars".parse::<Region>().is_err());
    }
}
