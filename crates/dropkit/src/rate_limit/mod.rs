//! Rate limiting primitives driven by upstream response headers.
//!
//! - [`RateLimitState`]: remaining quota, reset time, retry-after
//! - [`CircuitBreaker`]: consecutive-failure protection
//! - [`BackoffPolicy`]: jittered exponential retry delays
//! - [`ConditionalCacheStore`]: entity validators for conditional requests

mod backoff;
mod breaker;
mod cache;
mod headers;
mod state;

pub use backoff::BackoffPolicy;
pub use breaker::{BreakerStatus, CircuitBreaker};
pub use cache::{ConditionalCacheStore, Validators};
pub use headers::{parse_remaining, parse_reset, parse_retry_after, QuotaHeaderNames};
pub use state::{RateLimitState, DEFAULT_INITIAL_REMAINING};
