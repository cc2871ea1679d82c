use http::{HeaderMap, Method};

use crate::error::ApiError;
use crate::response::Response;

/// What an [`Interceptor`] gets to see about the request in flight.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub url: String,
    /// Attempts spent so far; zero while headers are still being shaped.
    pub attempts: u32,
    pub max_attempts: u32,
}

/// Composition seam for cross-cutting request behavior: auth headers,
/// request signing, audit logging.
///
/// `on_request` runs once per dispatched request, before the request is
/// frozen; header edits there apply to every attempt. `on_response` and
/// `on_error` run once, after the retry loop settles. Interceptors run in
/// registration order and must not panic.
pub trait Interceptor: Send + Sync {
    fn on_request(&self, context: &RequestContext, headers: &mut HeaderMap) {
        let _ = (context, headers);
    }

    fn on_response(&self, context: &RequestContext, response: &Response) {
        let _ = (context, response);
    }

    fn on_error(&self, context: &RequestContext, error: &ApiError) {
        let _ = (context, error);
    }
}
