use confidence::{ConfidenceOptions, ErrorCode, RateLimitOptions, Region, RetryConfig};
use std::time::Duration;

#[test]
fn test_default_values() {
    let options = ConfidenceOptions::new("client-secret");

    assert_eq!(options.client_secret, "client-secret");
    assert_eq!(options.region, Region::Global);
    assert_eq!(options.resolve_timeout, Duration::from_secs(10));
    assert_eq!(options.apply_debounce, Duration::from_millis(10));
    assert_eq!(options.apply_max_buffer_size, 100);
    assert_eq!(options.apply_fill_rate, 1.0);
    assert_eq!(options.apply_rate_limit.max_tokens, 2.0);
    assert_eq!(options.apply_rate_limit.initial_tokens, 3.0);
    assert_eq!(options.max_pending_applies, 1000);
    assert_eq!(options.apply_timeout, Duration::from_secs(30 * 60));
    assert_eq!(options.cache_max_entries, 1000);
    assert!(options.cache_ttl.is_none());
    assert!(!options.apply_on_resolve);
    assert!(options.base_url.is_none());
}

#[test]
fn test_builder_custom_values() {
    let options = ConfidenceOptions::builder("client-secret")
        .region(Region::Eu)
        .resolve_timeout(Duration::from_secs(2))
        .resolve_retry(RetryConfig::builder().max_retries(0).build())
        .apply_debounce(Duration::from_millis(50))
        .apply_max_buffer_size(10)
        .apply_rate_limit(
            5.0,
            RateLimitOptions {
                max_tokens: 5.0,
                initial_tokens: 5.0,
            },
        )
        .max_pending_applies(20)
        .cache_max_entries(10)
        .cache_ttl(Duration::from_secs(60))
        .apply_on_resolve(true)
        .build();

    assert_eq!(options.resolver_base_url(), "https://resolver.eu.confidence.dev");
    assert_eq!(options.resolve_timeout, Duration::from_secs(2));
    assert_eq!(options.resolve_retry.max_retries, 0);
    assert_eq!(options.apply_debounce, Duration::from_millis(50));
    assert_eq!(options.apply_max_buffer_size, 10);
    assert_eq!(options.apply_fill_rate, 5.0);
    assert_eq!(options.max_pending_applies, 20);
    assert_eq!(options.cache_ttl, Some(Duration::from_secs(60)));
    assert!(options.apply_on_resolve);
    assert!(options.validate().is_ok());
}

#[test]
fn test_region_hosts() {
    assert_eq!(Region::Global.resolver_base_url(), "https://resolver.confidence.dev");
    assert_eq!(Region::Us.resolver_base_url(), "https://resolver.us.confidence.dev");
    assert_eq!(Region::Global.events_base_url(), "https://events.eu.confidence.dev");
    assert_eq!(Region::Us.events_base_url(), "https://events.us.confidence.dev");
}

#[test]
fn test_base_url_override_wins_over_region() {
    let options = ConfidenceOptions::builder("client-secret")
        .region(Region::Us)
        .base_url("http://localhost:8090/")
        .build();

    assert_eq!(options.resolver_base_url(), "http://localhost:8090");
    assert!(options.validate().is_ok());
}

#[test]
fn test_validation_empty_secret() {
    let err = ConfidenceOptions::new("  ").validate().unwrap_err();
    assert_eq!(err.code, ErrorCode::ConfigInvalidSecret);
}

#[test]
fn test_validation_bad_base_url() {
    let err = ConfidenceOptions::builder("client-secret")
        .base_url("not a url")
        .build()
        .validate()
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ConfigInvalidUrl);

    let err = ConfidenceOptions::builder("client-secret")
        .base_url("ftp://resolver.test")
        .build()
        .validate()
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ConfigInvalidUrl);
}

#[test]
fn test_validation_rejects_zero_limits() {
    let zero_timeout = ConfidenceOptions::builder("client-secret")
        .resolve_timeout(Duration::ZERO)
        .build();
    assert_eq!(zero_timeout.validate().unwrap_err().code, ErrorCode::ConfigInvalidValue);

    let zero_buffer = ConfidenceOptions::builder("client-secret")
        .apply_max_buffer_size(0)
        .build();
    assert_eq!(zero_buffer.validate().unwrap_err().code, ErrorCode::ConfigInvalidValue);

    let no_rate = ConfidenceOptions::builder("client-secret")
        .apply_rate_limit(0.0, RateLimitOptions::default())
        .build();
    assert_eq!(no_rate.validate().unwrap_err().code, ErrorCode::ConfigInvalidValue);
}
