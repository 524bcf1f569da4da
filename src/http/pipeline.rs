//! Composable request pipeline.
//!
//! A [`FetchBuilder`] collects named stages and [`build`](FetchBuilder::build)s
//! them around a sink. Each stage wraps the chain built so far, so the stage
//! declared last sees a request first:
//!
//! ```rust,ignore
//! let fetch = FetchBuilder::new()
//!     .reject_not_ok()
//!     .retry(RetryConfig::default())
//!     .timeout(Duration::from_secs(10))
//!     .build(sink);
//! // timeout(retry(reject_not_ok(sink)))
//! ```

use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::rate_limit::{RateLimit, RateLimitOptions};
use super::request::{HttpRequest, HttpResponse, SharedFetch};
use super::retry::{Retry, RetryConfig};
use super::stages::{
    stamp_send_time, AbortPrevious, LimitPending, ModifyRequest, RejectOn, Route, Timeout,
};
use crate::error::Result;

type StageFactory = Arc<dyn Fn(SharedFetch) -> SharedFetch + Send + Sync>;

/// Accumulates stages. Building twice yields two independent pipelines, each
/// with its own limiter, pending counter and in-flight slot.
#[derive(Clone, Default)]
pub struct FetchBuilder {
    stages: Vec<(&'static str, StageFactory)>,
}

impl std::fmt::Debug for FetchBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchBuilder")
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl FetchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a custom stage.
    pub fn compose<F>(mut self, name: &'static str, factory: F) -> Self
    where
        F: Fn(SharedFetch) -> SharedFetch + Send + Sync + 'static,
    {
        self.stages.push((name, Arc::new(factory)));
        self
    }

    /// Fails with `Timeout` when the wrapped call takes longer than `duration`,
    /// cancelling whatever is still running below.
    pub fn timeout(self, duration: Duration) -> Self {
        self.compose("timeout", move |inner| Arc::new(Timeout::new(inner, duration)) as SharedFetch)
    }

    /// Cancels the previous in-flight call, which fails with `Superseded`.
    pub fn abort_previous(self) -> Self {
        self.compose("abort_previous", |inner| Arc::new(AbortPrevious::new(inner)) as SharedFetch)
    }

    pub fn reject_on<P>(self, predicate: P) -> Self
    where
        P: Fn(&HttpResponse) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        self.compose("reject_on", move |inner| {
            Arc::new(RejectOn::new(inner, predicate.clone())) as SharedFetch
        })
    }

    /// Rejects non-2xx responses with an `HttpStatus` error.
    pub fn reject_not_ok(self) -> Self {
        self.reject_on(|response| !response.is_success())
    }

    /// Fails with `CapacityExceeded` while `max` calls are already in flight.
    pub fn limit_pending(self, max: usize) -> Self {
        self.compose("limit_pending", move |inner| Arc::new(LimitPending::new(inner, max)) as SharedFetch)
    }

    /// Token bucket refilled at `fill_rate` tokens per second.
    pub fn rate_limit(self, fill_rate: f64, options: RateLimitOptions) -> Self {
        self.compose("rate_limit", move |inner| {
            Arc::new(RateLimit::new(inner, fill_rate, options)) as SharedFetch
        })
    }

    pub fn retry(self, config: RetryConfig) -> Self {
        self.compose("retry", move |inner| Arc::new(Retry::new(inner, config.clone())) as SharedFetch)
    }

    /// Rewrites each request before passing it on.
    pub fn modify_request<F, Fut>(self, modifier: F) -> Self
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpRequest>> + Send + 'static,
    {
        let modifier = Arc::new(modifier);
        self.compose("modify_request", move |inner| {
            let modifier = modifier.clone();
            Arc::new(ModifyRequest::new(
                inner,
                Arc::new(move |request: HttpRequest| modifier(request).boxed()),
            )) as SharedFetch
        })
    }

    pub fn stamp_send_time(self) -> Self {
        self.modify_request(stamp_send_time)
    }

    /// Sends requests matching `predicate` to `alternate` instead of the chain.
    pub fn route<P>(self, predicate: P, alternate: SharedFetch) -> Self
    where
        P: Fn(&HttpRequest) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        self.compose("route", move |inner| {
            Arc::new(Route::new(inner, predicate.clone(), alternate.clone())) as SharedFetch
        })
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|(name, _)| *name).collect()
    }

    pub fn build(&self, sink: SharedFetch) -> SharedFetch {
        tracing::debug!("Building fetch pipeline with stages {:?}", self.stage_names());
        self.stages
            .iter()
            .fold(sink, |inner, (_, factory)| factory(inner))
    }
}
