//! Resilient HTTP API client with retries, client-side rate limiting, and
//! a closed error taxonomy.
//!
//! Every request runs under three cooperating policies:
//!
//! - [`RetryPolicy`]: exponential backoff with jitter, honoring
//!   `Retry-After`, retrying only idempotent methods by default.
//! - [`RateLimitPolicy`]: a shared token bucket that paces dispatch
//!   before bytes hit the wire.
//! - A closed [`ApiError`] taxonomy: every failure is exactly one of
//!   seven variants, so callers can match exhaustively.
//!
//! The async [`Client`] rides on hyper; the [`blocking`] module offers
//! the same surface over ureq for callers without a runtime.
//!
//! ```no_run
//! use apix::{ApiError, Client, RetryPolicy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("https://api.example.com")
//!         .default_header("x-api-key", "secret")
//!         .retry_policy(RetryPolicy::standard())
//!         .try_build()?;
//!
//!     match client.get("/users").query_pair("page", "1").send().await {
//!         Ok(response) => {
//!             let users: serde_json::Value = response.json()?;
//!             println!("{users}");
//!         }
//!         Err(ApiError::RateLimit { retry_after, .. }) => {
//!             eprintln!("throttled, retry after {retry_after:?}");
//!         }
//!         Err(other) => return Err(other.into()),
//!     }
//!     Ok(())
//! }
//! ```

pub mod blocking;
mod cache;
mod client;
mod error;
mod metrics;
mod policy;
mod rate_limit;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub use cache::{CachePolicy, ResponseCache};
pub use client::{Client, ClientBuilder, RequestBuilder};
pub use error::{ApiError, ApiErrorKind, ApiResult, ConfigError, NetworkErrorKind};
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use policy::{Interceptor, RequestContext};
pub use rate_limit::{RateLimitPolicy, RateLimiter};
pub use request::{Body, Request};
pub use response::Response;
pub use retry::{RetryDecision, RetryPolicy};

pub mod prelude {
    //! One-line import for the common surface.
    pub use crate::{
        ApiError, ApiErrorKind, ApiResult, CachePolicy, Client, RateLimitPolicy, Request,
        Response, ResponseCache, RetryPolicy,
    };
}
