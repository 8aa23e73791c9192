//! HTTP edge middleware: request logging, API-key gate, rate limiting.

pub mod api_key;
pub mod logging;
pub mod rate_limit;

pub use api_key::{api_key_middleware, ApiKeyGate};
pub use logging::request_logging;
pub use rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimiter};
