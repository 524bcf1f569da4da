//! The Confidence client.

use futures::FutureExt;
use std::sync::Arc;

use crate::core::{
    ApplyConfig, ApplyManager, ApplySender, CacheOptions, ConfidenceOptions, Deferred,
    FlagEvaluation, FlagResolution, FlagResolver, PendingApply, Settlement, StreamingCache,
    APPLY_PATH, RESOLVE_PATH,
};
use crate::error::{ErrorCode, Result};
use crate::http::{FetchBuilder, HttpRequest, ReqwestFetch, SharedFetch};
use crate::types::{Context, Value};

struct Shared {
    options: ConfidenceOptions,
    resolver: FlagResolver,
    cache: StreamingCache<FlagResolution>,
    apply: ApplyManager,
}

/// Evaluates flags for a context.
///
/// Clones and derived clients from [`Confidence::with_context`] share the
/// resolver, the resolution cache and the apply engine.
#[derive(Clone)]
pub struct Confidence {
    shared: Arc<Shared>,
    context: Context,
}

impl std::fmt::Debug for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Confidence")
            .field("base_url", &self.shared.options.resolver_base_url())
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Builds the front door: applies and resolves each get their own stages,
/// anything else goes straight to the sink.
fn front_door(options: &ConfidenceOptions, sink: SharedFetch) -> SharedFetch {
    let apply = FetchBuilder::new()
        .stamp_send_time()
        .reject_not_ok()
        .retry(options.apply_retry.clone())
        .rate_limit(options.apply_fill_rate, options.apply_rate_limit)
        .timeout(options.apply_timeout)
        .limit_pending(options.max_pending_applies)
        .build(sink.clone());

    let resolve = FetchBuilder::new()
        .reject_not_ok()
        .retry(options.resolve_retry.clone())
        .timeout(options.resolve_timeout)
        .build(sink.clone());

    FetchBuilder::new()
        .route(|request: &HttpRequest| request.path().ends_with(APPLY_PATH), apply)
        .route(|request: &HttpRequest| request.path().ends_with(RESOLVE_PATH), resolve)
        .build(sink)
}

impl Confidence {
    /// Creates a client that talks to the resolver over HTTPS.
    pub fn new(options: ConfidenceOptions) -> Result<Self> {
        options.validate()?;
        let sink: SharedFetch = Arc::new(ReqwestFetch::new(options.connect_timeout)?);
        Self::with_fetch(options, sink)
    }

    /// Creates a client on top of a caller-supplied transport.
    pub fn with_fetch(options: ConfidenceOptions, sink: SharedFetch) -> Result<Self> {
        options.validate()?;

        let resolver = FlagResolver::new(
            front_door(&options, sink),
            options.resolver_base_url(),
            options.client_secret.clone(),
            options.apply_on_resolve,
        );

        let sender_resolver = resolver.clone();
        let sender: ApplySender = Arc::new(move |token: String, flags: Vec<PendingApply>| {
            let resolver = sender_resolver.clone();
            async move { resolver.apply(&token, &flags).await }.boxed()
        });
        let apply = ApplyManager::new(
            ApplyConfig::builder()
                .debounce(options.apply_debounce)
                .max_buffer_size(options.apply_max_buffer_size)
                .enabled(!options.apply_on_resolve)
                .build(),
            sender,
        );

        let cache = StreamingCache::new(CacheOptions {
            max_entries: Some(options.cache_max_entries),
            ttl: options.cache_ttl,
        });

        tracing::debug!("Confidence client created for {}", options.resolver_base_url());

        Ok(Self {
            shared: Arc::new(Shared {
                options,
                resolver,
                cache,
                apply,
            }),
            context: Context::new(),
        })
    }

    pub fn options(&self) -> &ConfidenceOptions {
        &self.shared.options
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// A client whose context is this one's merged with `child`.
    pub fn with_context(&self, child: Context) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            context: self.context.merge(&child),
        }
    }

    /// The resolution cache, keyed by canonical context. Used for warm starts
    /// through `serialize()` and `load()`.
    pub fn cache(&self) -> &StreamingCache<FlagResolution> {
        &self.shared.cache
    }

    fn cached_resolution(&self) -> Deferred<FlagResolution> {
        let resolver = self.shared.resolver.clone();
        let context = self.context.clone();
        self.shared
            .cache
            .get_or_insert_with(&self.context.canonical_key(), move || async move {
                resolver.try_resolve(&context, &[]).await
            })
    }

    /// Resolves all flags for the current context.
    ///
    /// Concurrent calls for equal contexts share one request. A failed
    /// resolve is returned to its waiters but not cached.
    pub async fn resolve(&self) -> FlagResolution {
        match self.cached_resolution().unwrap_or_suspend().await {
            Ok(resolution) => resolution,
            Err(e) => {
                tracing::warn!("Flag resolve failed: {}", e);
                FlagResolution::failed(self.context.clone(), &e)
            }
        }
    }

    pub async fn evaluate_flag<T>(&self, path: &str, default: T) -> FlagEvaluation<T>
    where
        T: Clone + Into<Value> + TryFrom<Value>,
    {
        let resolution = self.resolve().await;
        let evaluation = resolution.evaluate(path, default);
        self.record_apply(&evaluation);
        evaluation
    }

    pub async fn get_flag<T>(&self, path: &str, default: T) -> T
    where
        T: Clone + Into<Value> + TryFrom<Value>,
    {
        self.evaluate_flag(path, default).await.value
    }

    /// Evaluates against whatever is cached right now.
    ///
    /// While the context is still resolving this returns the default with
    /// `PROVIDER_NOT_READY`; if nothing is cached a resolve is started.
    pub fn try_evaluate_flag<T>(&self, path: &str, default: T) -> FlagEvaluation<T>
    where
        T: Clone + Into<Value> + TryFrom<Value>,
    {
        let state = self
            .shared
            .cache
            .get(&self.context.canonical_key())
            .unwrap_or_else(|| self.cached_resolution())
            .peek();

        match state {
            Settlement::Ready(resolution) => {
                let evaluation = resolution.evaluate(path, default);
                self.record_apply(&evaluation);
                evaluation
            }
            Settlement::Failed(e) => FlagEvaluation::failed(default, e),
            Settlement::Pending => FlagEvaluation::error(
                default,
                ErrorCode::ProviderNotReady,
                "Flags for this context are still resolving",
            ),
        }
    }

    fn record_apply<T>(&self, evaluation: &FlagEvaluation<T>) {
        if self.shared.resolver.apply_on_resolve() {
            return;
        }
        if let Some(ticket) = evaluation.apply_ticket() {
            self.shared.apply.apply(&ticket.resolve_token, &ticket.flag);
        }
    }

    /// Sends all pending applies.
    pub async fn flush(&self) {
        self.shared.apply.flush().await;
    }

    /// Flushes pending applies and stops the background apply task.
    pub async fn close(&self) {
        self.shared.apply.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::fetch_fn;
    use crate::error::ConfidenceError;
    use crate::http::HttpResponse;

    fn unreachable_sink() -> SharedFetch {
        fetch_fn(|_request: HttpRequest| async move {
            Err::<HttpResponse, _>(ConfidenceError::network_error("offline"))
        })
    }

    #[test]
    fn test_with_fetch_validates_options() {
        let err = Confidence::with_fetch(ConfidenceOptions::new(""), unreachable_sink()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidSecret);
    }

    #[test]
    fn test_with_context_merges() {
        let client = Confidence::with_fetch(ConfidenceOptions::new("secret"), unreachable_sink())
            .unwrap()
            .with_context(Context::with_targeting_key("user-1").with("country", "SE"));
        let child = client.with_context(Context::new().with("country", "NO"));

        assert_eq!(child.context().targeting_key(), Some("user-1"));
        assert_eq!(child.context().get("country"), Some(&Value::from("NO")));
        assert_eq!(client.context().get("country"), Some(&Value::from("SE")));
    }
}
