use async_trait::async_trait;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::request::{Fetch, HttpRequest, HttpResponse, SharedFetch};
use crate::error::{ConfidenceError, ErrorCode, Result};

pub(crate) type RequestPredicate = Arc<dyn Fn(&HttpRequest) -> bool + Send + Sync>;
pub(crate) type ResponsePredicate = Arc<dyn Fn(&HttpResponse) -> bool + Send + Sync>;
pub(crate) type RequestModifier =
    Arc<dyn Fn(HttpRequest) -> BoxFuture<'static, Result<HttpRequest>> + Send + Sync>;

pub(crate) struct Timeout {
    inner: SharedFetch,
    duration: Duration,
}

impl Timeout {
    pub(crate) fn new(inner: SharedFetch, duration: Duration) -> Self {
        Self { inner, duration }
    }
}

#[async_trait]
impl Fetch for Timeout {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        let scope = request.signal().child_token();
        let request = request.with_signal(scope.clone());
        match tokio::time::timeout(self.duration, self.inner.fetch(request)).await {
            Ok(result) => result,
            Err(_) => {
                scope.cancel();
                Err(ConfidenceError::timeout(self.duration))
            }
        }
    }
}

/// Keeps at most one call in flight; a new call supersedes the previous one.
pub(crate) struct AbortPrevious {
    inner: SharedFetch,
    generation: AtomicU64,
    current: Mutex<Option<(u64, CancellationToken)>>,
}

impl AbortPrevious {
    pub(crate) fn new(inner: SharedFetch) -> Self {
        Self {
            inner,
            generation: AtomicU64::new(0),
            current: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Fetch for AbortPrevious {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        let caller = request.signal().clone();
        let token = caller.child_token();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        if let Some((_, previous)) = self.current.lock().replace((generation, token.clone())) {
            tracing::debug!("Superseding in-flight request to {}", request.url);
            previous.cancel();
        }

        let aborted = || {
            if caller.is_cancelled() {
                ConfidenceError::cancelled()
            } else {
                ConfidenceError::superseded()
            }
        };

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(aborted()),
            result = self.inner.fetch(request.with_signal(token.clone())) => match result {
                Err(e) if e.code == ErrorCode::Cancelled && token.is_cancelled() => Err(aborted()),
                other => other,
            },
        };

        let mut current = self.current.lock();
        if matches!(&*current, Some((g, _)) if *g == generation) {
            *current = None;
        }
        result
    }
}

pub(crate) struct RejectOn {
    inner: SharedFetch,
    predicate: ResponsePredicate,
}

impl RejectOn {
    pub(crate) fn new(inner: SharedFetch, predicate: ResponsePredicate) -> Self {
        Self { inner, predicate }
    }
}

#[async_trait]
impl Fetch for RejectOn {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self.inner.fetch(request).await?;
        if (self.predicate)(&response) {
            let text = response.text();
            let message = if text.is_empty() {
                format!("HTTP {}", response.status)
            } else {
                format!("HTTP {}: {}", response.status, text)
            };
            return Err(ConfidenceError::status(response.status, message));
        }
        Ok(response)
    }
}

/// Rejects calls beyond `max` in flight instead of queueing them.
pub(crate) struct LimitPending {
    inner: SharedFetch,
    max: usize,
    pending: AtomicUsize,
}

struct PendingSlot<'a>(&'a AtomicUsize);

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl LimitPending {
    pub(crate) fn new(inner: SharedFetch, max: usize) -> Self {
        Self {
            inner,
            max,
            pending: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Fetch for LimitPending {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        let in_flight = self.pending.fetch_add(1, Ordering::AcqRel);
        let _slot = PendingSlot(&self.pending);
        if in_flight >= self.max {
            tracing::warn!("Rejecting request to {}: {} requests pending", request.url, in_flight);
            return Err(ConfidenceError::capacity_exceeded(self.max));
        }
        self.inner.fetch(request).await
    }
}

pub(crate) struct ModifyRequest {
    inner: SharedFetch,
    modifier: RequestModifier,
}

impl ModifyRequest {
    pub(crate) fn new(inner: SharedFetch, modifier: RequestModifier) -> Self {
        Self { inner, modifier }
    }
}

#[async_trait]
impl Fetch for ModifyRequest {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        let request = (self.modifier)(request).await?;
        self.inner.fetch(request).await
    }
}

pub(crate) struct Route {
    inner: SharedFetch,
    predicate: RequestPredicate,
    alternate: SharedFetch,
}

impl Route {
    pub(crate) fn new(inner: SharedFetch, predicate: RequestPredicate, alternate: SharedFetch) -> Self {
        Self {
            inner,
            predicate,
            alternate,
        }
    }
}

#[async_trait]
impl Fetch for Route {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        if (self.predicate)(&request) {
            self.alternate.fetch(request).await
        } else {
            self.inner.fetch(request).await
        }
    }
}

/// Sets the JSON body's `sendTime` to the current time.
pub async fn stamp_send_time(mut request: HttpRequest) -> Result<HttpRequest> {
    let mut body: serde_json::Value = request.json()?;
    if let Some(fields) = body.as_object_mut() {
        fields.insert(
            "sendTime".to_string(),
            serde_json::Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
    }
    let encoded = serde_json::to_vec(&body).map_err(|e| {
        ConfidenceError::with_source(ErrorCode::InvalidResponse, "Failed to encode request body", e)
    })?;
    request.body = Bytes::from(encoded);
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_stamp_send_time() {
        let request = HttpRequest::post_json("http://localhost/v1/flags:apply", &json!({"flags": []})).unwrap();
        let stamped = stamp_send_time(request).await.unwrap();
        let body: serde_json::Value = stamped.json().unwrap();
        let send_time = body["sendTime"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(send_time).is_ok());
        assert_eq!(body["flags"], json!([]));
    }
}
