mod apply;
mod cache;
mod config;
mod resolution;
mod resolver;

pub use apply::{
    ApplyConfig, ApplyConfigBuilder, ApplyManager, ApplySender, DEFAULT_MAX_TRACKED_TOKENS,
};
pub use cache::{CacheOptions, CacheRef, Deferred, Settlement, StreamingCache};
pub use config::{
    default_apply_retry, default_resolve_retry, ConfidenceOptions, ConfidenceOptionsBuilder,
    Region, DEFAULT_APPLY_DEBOUNCE, DEFAULT_APPLY_FILL_RATE, DEFAULT_APPLY_INITIAL_TOKENS,
    DEFAULT_APPLY_MAX_BUFFER_SIZE, DEFAULT_APPLY_MAX_TOKENS, DEFAULT_APPLY_TIMEOUT,
    DEFAULT_CACHE_MAX_ENTRIES, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_PENDING_APPLIES,
    DEFAULT_RESOLVE_TIMEOUT,
};
pub use resolution::{ApplyTicket, FlagEvaluation, FlagResolution, ResolveReason, ResolvedFlag};
pub use resolver::{FlagResolver, PendingApply, APPLY_PATH, RESOLVE_PATH, SDK_ID, SDK_VERSION};
