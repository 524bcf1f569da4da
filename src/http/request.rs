//! Request and response types, and the [`Fetch`] seam every pipeline stage wraps.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{ConfidenceError, ErrorCode, Result};

/// An outgoing request.
///
/// The body is held as [`Bytes`] so retries can cheaply re-send it, and the
/// request carries its own cancellation signal through every stage.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    signal: CancellationToken,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            signal: CancellationToken::new(),
        }
    }

    pub fn post_json<T: Serialize + ?Sized>(url: impl Into<String>, body: &T) -> Result<Self> {
        let body = serde_json::to_vec(body).map_err(|e| {
            ConfidenceError::with_source(ErrorCode::InvalidResponse, "Failed to encode request body", e)
        })?;
        let mut request = Self::new(Method::POST, url);
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        request.body = Bytes::from(body);
        Ok(request)
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            ConfidenceError::with_source(ErrorCode::InvalidResponse, "Request body is not valid JSON", e)
        })
    }

    /// The URL path, without scheme, host or query.
    pub fn path(&self) -> &str {
        let rest = match self.url.find("://") {
            Some(i) => &self.url[i + 3..],
            None => &self.url,
        };
        let path = rest.find('/').map(|i| &rest[i..]).unwrap_or("/");
        path.split('?').next().unwrap_or(path)
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn json_body(status: u16, body: &serde_json::Value) -> Self {
        let mut response = Self::new(status, body.to_string());
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            ConfidenceError::with_source(ErrorCode::InvalidResponse, "Failed to parse response", e)
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends a request. Implemented by the network sink and by every pipeline stage.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse>;
}

pub type SharedFetch = Arc<dyn Fetch>;

struct FnFetch<F>(F);

#[async_trait]
impl<F, Fut> Fetch for FnFetch<F>
where
    F: Fn(HttpRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HttpResponse>> + Send,
{
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        (self.0)(request).await
    }
}

/// Adapts an async closure into a [`Fetch`].
pub fn fetch_fn<F, Fut>(f: F) -> SharedFetch
where
    F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponse>> + Send + 'static,
{
    Arc::new(FnFetch(f))
}

/// The network sink, backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestFetch {
    client: reqwest::Client,
}

impl ReqwestFetch {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("confidence-sdk-rust/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfidenceError::with_source(ErrorCode::NetworkError, "Failed to create HTTP client", e))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn convert_error(error: reqwest::Error) -> ConfidenceError {
        if error.is_timeout() {
            ConfidenceError::with_source(ErrorCode::Timeout, "Request timed out", error)
        } else if error.is_connect() {
            ConfidenceError::with_source(ErrorCode::NetworkError, "Connection failed", error)
        } else {
            ConfidenceError::with_source(ErrorCode::NetworkError, error.to_string(), error)
        }
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(Self::convert_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(Self::convert_error)?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Fetch for ReqwestFetch {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        let signal = request.signal().clone();
        tokio::select! {
            _ = signal.cancelled() => Err(ConfidenceError::cancelled()),
            result = self.send(request) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path() {
        let request = HttpRequest::new(Method::POST, "https://resolver.confidence.dev/v1/flags:resolve?x=1");
        assert_eq!(request.path(), "/v1/flags:resolve");
        assert_eq!(HttpRequest::new(Method::GET, "http://localhost").path(), "/");
    }

    #[test]
    fn test_post_json_sets_content_type() {
        let request = HttpRequest::post_json("http://localhost/a", &serde_json::json!({"a": 1})).unwrap();
        assert_eq!(request.header("content-type"), Some("application/json"));
        let body: serde_json::Value = request.json().unwrap();
        assert_eq!(body["a"], 1);
    }

    #[tokio::test]
    async fn test_fetch_fn() {
        let fetch = fetch_fn(|request: HttpRequest| async move {
            Ok::<_, ConfidenceError>(HttpResponse::new(200, request.url))
        });
        let response = fetch
            .fetch(HttpRequest::new(Method::GET, "http://localhost/echo"))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.text(), "http://localhost/echo");
    }
}
