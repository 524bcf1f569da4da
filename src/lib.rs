//! Confidence Rust SDK
//!
//! Client core for Confidence feature flags: a composable, cancellable HTTP
//! pipeline, flag resolution with schema-checked evaluation, batched apply
//! reporting and a streaming resolution cache that can be serialized and
//! loaded for warm starts.
//!
//! # Quick Start
//!
//! ```no_run
//! use confidence::{Confidence, ConfidenceOptions, Context};
//!
//! #[tokio::main]
//! async fn main() -> confidence::Result<()> {
//!     let client = Confidence::new(ConfidenceOptions::new("client-secret"))?
//!         .with_context(Context::with_targeting_key("user-123"));
//!
//!     let enabled = client.get_flag("tutorial.enabled", false).await;
//!     let title = client.get_flag("tutorial.title", "Welcome".to_string()).await;
//!     println!("{} {}", enabled, title);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod error;
pub mod http;
pub mod types;
mod client;

pub use crate::client::Confidence;

pub use crate::error::{ConfidenceError, ErrorCode, Result};

pub use crate::types::{Context, Mismatch, Schema, TypeMismatch, Value, TARGETING_KEY};

pub use crate::core::{
    ApplyConfig, ApplyManager, CacheOptions, CacheRef, ConfidenceOptions,
    ConfidenceOptionsBuilder, Deferred, FlagEvaluation, FlagResolution, FlagResolver,
    PendingApply, Region, ResolveReason, Settlement, StreamingCache,
};

pub use crate::http::{
    fetch_fn, Fetch, FetchBuilder, HttpRequest, HttpResponse, RateLimitOptions, ReqwestFetch,
    RetryConfig, SharedFetch,
};
