//! Resolve and apply calls against the flag resolver.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::resolution::{FlagResolution, ResolvedFlagRecord, FLAG_PREFIX};
use crate::error::{ConfidenceError, ErrorCode, Result};
use crate::http::{HttpRequest, SharedFetch};
use crate::types::{Context, Value};

pub const RESOLVE_PATH: &str = "/v1/flags:resolve";
pub const APPLY_PATH: &str = "/v1/flags:apply";
pub const SDK_ID: &str = "SDK_ID_RUST_PROVIDER";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A flag use waiting to be reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingApply {
    pub flag: String,
    pub apply_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct Sdk {
    id: &'static str,
    version: &'static str,
}

const SDK: Sdk = Sdk {
    id: SDK_ID,
    version: SDK_VERSION,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResolveRequest<'a> {
    client_secret: &'a str,
    evaluation_context: Value,
    apply: bool,
    flags: Vec<String>,
    sdk: Sdk,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveResponse {
    #[serde(default)]
    resolved_flags: Vec<ResolvedFlagRecord>,
    #[serde(default)]
    resolve_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApplyRequest<'a> {
    client_secret: &'a str,
    #[serde(rename = "resolve_token")]
    resolve_token: &'a str,
    flags: Vec<AppliedFlag>,
    send_time: String,
    sdk: Sdk,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AppliedFlag {
    flag: String,
    apply_time: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApplyResponse {
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

fn timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Talks to the resolver through a composed fetch pipeline.
#[derive(Clone)]
pub struct FlagResolver {
    fetch: SharedFetch,
    base_url: String,
    client_secret: String,
    apply_on_resolve: bool,
}

impl std::fmt::Debug for FlagResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlagResolver")
            .field("base_url", &self.base_url)
            .field("apply_on_resolve", &self.apply_on_resolve)
            .finish_non_exhaustive()
    }
}

impl FlagResolver {
    pub fn new(
        fetch: SharedFetch,
        base_url: impl Into<String>,
        client_secret: impl Into<String>,
        apply_on_resolve: bool,
    ) -> Self {
        Self {
            fetch,
            base_url: base_url.into(),
            client_secret: client_secret.into(),
            apply_on_resolve,
        }
    }

    pub fn apply_on_resolve(&self) -> bool {
        self.apply_on_resolve
    }

    /// Resolves `flags` (all flags when empty). Failures come back as a
    /// failed resolution carrying the transport error code.
    pub async fn resolve(&self, context: &Context, flags: &[&str]) -> FlagResolution {
        match self.try_resolve(context, flags).await {
            Ok(resolution) => resolution,
            Err(e) => {
                tracing::warn!("Flag resolve failed: {}", e);
                FlagResolution::failed(context.clone(), &e)
            }
        }
    }

    pub async fn try_resolve(&self, context: &Context, flags: &[&str]) -> Result<FlagResolution> {
        self.try_resolve_with(context, flags, CancellationToken::new())
            .await
    }

    pub async fn try_resolve_with(
        &self,
        context: &Context,
        flags: &[&str],
        signal: CancellationToken,
    ) -> Result<FlagResolution> {
        let body = ResolveRequest {
            client_secret: &self.client_secret,
            evaluation_context: context.to_value(),
            apply: self.apply_on_resolve,
            flags: flags
                .iter()
                .map(|name| format!("{}{}", FLAG_PREFIX, name))
                .collect(),
            sdk: SDK,
        };
        let request = HttpRequest::post_json(format!("{}{}", self.base_url, RESOLVE_PATH), &body)?
            .with_signal(signal);

        let response = self.fetch.fetch(request).await?;
        let parsed: ResolveResponse = response.json()?;
        let resolve_token = parsed
            .resolve_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ConfidenceError::invalid_response("Resolve response has no resolve token"))?;

        let flags = parsed
            .resolved_flags
            .into_iter()
            .map(ResolvedFlagRecord::into_flag)
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            "Resolved {} flags for targeting key {:?}",
            flags.len(),
            context.targeting_key()
        );

        Ok(FlagResolution::ready(context.clone(), resolve_token, flags))
    }

    /// Reports flag uses for one resolve token.
    pub async fn apply(&self, resolve_token: &str, flags: &[PendingApply]) -> Result<()> {
        if flags.is_empty() {
            return Ok(());
        }

        let body = ApplyRequest {
            client_secret: &self.client_secret,
            resolve_token,
            flags: flags
                .iter()
                .map(|pending| AppliedFlag {
                    flag: format!("{}{}", FLAG_PREFIX, pending.flag),
                    apply_time: timestamp(&pending.apply_time),
                })
                .collect(),
            send_time: timestamp(&Utc::now()),
            sdk: SDK,
        };
        let request = HttpRequest::post_json(format!("{}{}", self.base_url, APPLY_PATH), &body)?;
        let response = self.fetch.fetch(request).await?;

        let parsed: ApplyResponse = if response.body.is_empty() {
            ApplyResponse::default()
        } else {
            response.json().unwrap_or_default()
        };
        if !parsed.errors.is_empty() {
            return Err(ConfidenceError::new(
                ErrorCode::PublishPartialFailure,
                format!("{} of {} applies rejected", parsed.errors.len(), flags.len()),
            ));
        }

        tracing::debug!("Applied {} flags", flags.len());
        Ok(())
    }
}
