use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::types::TypeMismatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Transport errors
    NetworkError,
    Timeout,
    Superseded,
    Cancelled,
    CapacityExceeded,
    HttpStatus,
    InvalidResponse,

    // Evaluation errors
    FlagNotFound,
    TypeMismatch,
    General,
    ProviderNotReady,

    // Apply errors
    PublishPartialFailure,

    // Configuration errors
    ConfigInvalidSecret,
    ConfigInvalidUrl,
    ConfigInvalidValue,

    // Cache errors
    CacheInvalidData,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Superseded => "SUPERSEDED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::CapacityExceeded => "CAPACITY_EXCEEDED",
            ErrorCode::HttpStatus => "HTTP_STATUS",
            ErrorCode::InvalidResponse => "INVALID_RESPONSE",
            ErrorCode::FlagNotFound => "FLAG_NOT_FOUND",
            ErrorCode::TypeMismatch => "TYPE_MISMATCH",
            ErrorCode::General => "GENERAL",
            ErrorCode::ProviderNotReady => "PROVIDER_NOT_READY",
            ErrorCode::PublishPartialFailure => "PUBLISH_PARTIAL_FAILURE",
            ErrorCode::ConfigInvalidSecret => "CONFIG_INVALID_SECRET",
            ErrorCode::ConfigInvalidUrl => "CONFIG_INVALID_URL",
            ErrorCode::ConfigInvalidValue => "CONFIG_INVALID_VALUE",
            ErrorCode::CacheInvalidData => "CACHE_INVALID_DATA",
        }
    }

    /// Whether the error was raised by the request pipeline or the network below it.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkError
                | ErrorCode::Timeout
                | ErrorCode::Superseded
                | ErrorCode::Cancelled
                | ErrorCode::CapacityExceeded
                | ErrorCode::HttpStatus
                | ErrorCode::InvalidResponse
        )
    }

    /// Whether the error is reported to callers as part of a flag evaluation.
    pub fn is_evaluation(&self) -> bool {
        matches!(
            self,
            ErrorCode::FlagNotFound
                | ErrorCode::TypeMismatch
                | ErrorCode::General
                | ErrorCode::ProviderNotReady
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug, Clone)]
#[error("[{code}] {message}")]
pub struct ConfidenceError {
    pub code: ErrorCode,
    pub message: String,
    /// HTTP status for `HttpStatus` errors.
    pub status: Option<u16>,
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ConfidenceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            source: None,
        }
    }

    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            source: Some(Arc::new(source)),
        }
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(ErrorCode::Timeout, format!("Request timed out after {:?}", after))
    }

    pub fn superseded() -> Self {
        Self::new(ErrorCode::Superseded, "Request superseded by a newer call")
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "Request cancelled")
    }

    pub fn capacity_exceeded(max_pending: usize) -> Self {
        Self::new(
            ErrorCode::CapacityExceeded,
            format!("Too many pending requests (limit {})", max_pending),
        )
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::HttpStatus,
            message: message.into(),
            status: Some(status),
            source: None,
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidResponse, message)
    }

    pub fn flag_not_found(flag: &str) -> Self {
        Self::new(ErrorCode::FlagNotFound, format!("Flag '{}' not found", flag))
    }

    pub fn type_mismatch(mismatch: TypeMismatch) -> Self {
        Self::new(ErrorCode::TypeMismatch, mismatch.to_string())
    }

    pub fn config_error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code, message)
    }

    pub fn is_transport_error(&self) -> bool {
        self.code.is_transport()
    }

    pub fn is_evaluation_error(&self) -> bool {
        self.code.is_evaluation()
    }

    /// Whether a retry stage may re-issue the call that produced this error.
    ///
    /// Cancellation and supersession are final: a caller that gave up, or a
    /// call that lost the race to a newer one, is never retried.
    pub fn is_retryable(&self) -> bool {
        match self.code {
            ErrorCode::NetworkError | ErrorCode::Timeout | ErrorCode::CapacityExceeded => true,
            ErrorCode::HttpStatus => matches!(self.status, Some(s) if s >= 500 || s == 408 || s == 429),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfidenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code() {
        let error = ConfidenceError::flag_not_found("checkout");
        assert_eq!(error.to_string(), "[FLAG_NOT_FOUND] Flag 'checkout' not found");
    }

    #[test]
    fn test_status_error_retryability() {
        assert!(ConfidenceError::status(503, "unavailable").is_retryable());
        assert!(ConfidenceError::status(429, "slow down").is_retryable());
        assert!(!ConfidenceError::status(400, "bad request").is_retryable());
        assert!(!ConfidenceError::status(401, "unauthorized").is_retryable());
    }

    #[test]
    fn test_cancellation_is_final() {
        assert!(!ConfidenceError::cancelled().is_retryable());
        assert!(!ConfidenceError::superseded().is_retryable());
        assert!(ConfidenceError::timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_serde_name_matches_as_str() {
        let json = serde_json::to_string(&ErrorCode::PublishPartialFailure).unwrap();
        assert_eq!(json, "\"PUBLISH_PARTIAL_FAILURE\"");
        let code: ErrorCode = serde_json::from_str("\"TYPE_MISMATCH\"").unwrap();
        assert_eq!(code, ErrorCode::TypeMismatch);
    }

    #[test]
    fn test_clone_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "socket closed");
        let error = ConfidenceError::with_source(ErrorCode::NetworkError, "send failed", io);
        let cloned = error.clone();
        assert!(std::error::Error::source(&cloned).is_some());
    }
}
