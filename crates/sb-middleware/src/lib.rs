//! The concrete interceptor library.
//!
//! Every middleware here is an [`sb_core::Interceptor`] over the shared
//! envelope/context and can be installed globally (router builder),
//! per-group (`for_pattern`), or per-handler (registration options).

pub mod auth;
pub mod cache;
pub mod circuit;
pub mod logging;
pub mod rate_limit;
pub mod request_id;
pub mod retry;
pub mod timeout;
pub mod wrap;

pub use auth::{
    ApiKeyAuth, AuthOutcome, AuthStrategy, Authentication, Authorization, BearerAuth, CookieAuth,
    QueryParamAuth,
};
pub use cache::{Cache, CacheConfig};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig};
pub use logging::{LoggingConfig, REDACTED_HEADERS, RequestLogging};
pub use rate_limit::{KeySelector, RateLimit, RateLimitAlgorithm, RateLimitRule};
pub use request_id::{REQUEST_ID_HEADER, RequestId};
pub use retry::{Backoff, Retry, RetryPolicy};
pub use sb_core::{MemoryStore, Store};
pub use timeout::Timeout;
pub use wrap::EnvelopeWrap;
