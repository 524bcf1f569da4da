mod pipeline;
mod rate_limit;
mod request;
pub mod retry;
mod stages;

pub use pipeline::FetchBuilder;
pub use rate_limit::RateLimitOptions;
pub use request::{fetch_fn, Fetch, HttpRequest, HttpResponse, ReqwestFetch, SharedFetch};
pub use retry::{RetryConfig, RetryConfigBuilder};
pub use stages::stamp_send_time;
