use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, header};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{Instrument, debug, info_span, warn};

use crate::cache::{ResponseCache, cache_key};
use crate::error::{ApiResult, ConfigError, error_from_response, invalid_request_error};
use crate::metrics::ClientMetrics;
use crate::policy::{Interceptor, RequestContext};
use crate::rate_limit::{RateLimitPolicy, RateLimiter};
use crate::request::{Request, RequestParts};
use crate::response::Response;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::transport::Transport;
use crate::util::{parse_header_name, parse_header_value, parse_retry_after, redact_uri_for_logs};

pub(crate) const DEFAULT_USER_AGENT: &str = concat!("apix/", env!("CARGO_PKG_VERSION"));
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolConfig {
    pub(crate) idle_timeout: Duration,
    pub(crate) max_idle_per_host: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            idle_timeout: Duration::from_secs(90),
            max_idle_per_host: 8,
        }
    }
}

/// Configures and builds a [`Client`].
pub struct ClientBuilder {
    base_url: String,
    default_headers: Vec<(String, String)>,
    user_agent: String,
    timeout: Duration,
    retry_policy: RetryPolicy,
    rate_limit: Option<RateLimitPolicy>,
    cache: Option<Arc<ResponseCache>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    pool: PoolConfig,
}

impl ClientBuilder {
    fn new(base_url: impl Into<String>) -> Self {
        ClientBuilder {
            base_url: base_url.into(),
            default_headers: Vec::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            retry_policy: RetryPolicy::standard(),
            rate_limit: None,
            cache: None,
            interceptors: Vec::new(),
            pool: PoolConfig::default(),
        }
    }

    /// Header sent with every request unless a request overrides it.
    pub fn default_header(mut self, name: &str, value: &str) -> Self {
        self.default_headers
            .push((name.to_string(), value.to_string()));
        self
    }

    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    /// Per-attempt timeout applied when a request sets none of its own.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Enables client-side pacing. All requests through this client (and
    /// its clones) share one bucket.
    pub fn rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = Some(policy);
        self
    }

    /// Caches successful GET responses. Pass the same `Arc` to several
    /// clients to share one cache.
    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Registers an interceptor; they run in registration order.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn pool_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.pool.idle_timeout = idle_timeout;
        self
    }

    pub fn pool_max_idle_per_host(mut self, max_idle_per_host: usize) -> Self {
        self.pool.max_idle_per_host = max_idle_per_host.max(1);
        self
    }

    pub fn try_build(self) -> Result<Client, ConfigError> {
        let parsed = url::Url::parse(&self.base_url).map_err(|_| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url.clone(),
            });
        }

        let mut default_headers = HeaderMap::new();
        for (name, value) in &self.default_headers {
            let name = parse_header_name(name)?;
            let value = parse_header_value(name.as_str(), value)?;
            default_headers.insert(name, value);
        }
        if !default_headers.contains_key(header::USER_AGENT) {
            let value = parse_header_value("user-agent", &self.user_agent)?;
            default_headers.insert(header::USER_AGENT, value);
        }

        Ok(Client {
            base_url: self.base_url,
            default_headers,
            timeout: self.timeout,
            retry_policy: self.retry_policy,
            rate_limiter: self.rate_limit.map(|policy| Arc::new(RateLimiter::new(policy))),
            cache: self.cache,
            interceptors: self.interceptors,
            transport: Transport::new(&self.pool)?,
            metrics: ClientMetrics::default(),
        })
    }
}

/// Async HTTP API client.
///
/// Cloning is cheap and clones share everything that matters: the
/// connection pool, the rate limiter bucket, the cache, and the metrics
/// counters. Hand clones to tasks freely.
#[derive(Clone)]
pub struct Client {
    base_url: String,
    default_headers: HeaderMap,
    timeout: Duration,
    retry_policy: RetryPolicy,
    rate_limiter: Option<Arc<RateLimiter>>,
    cache: Option<Arc<ResponseCache>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    transport: Transport,
    metrics: ClientMetrics,
}

impl Client {
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    pub fn request(&self, method: Method, path: &str) -> RequestBuilder<'_> {
        RequestBuilder {
            client: self,
            parts: RequestParts::new(method, path),
            retry_override: None,
        }
    }

    pub fn get(&self, path: &str) -> RequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> RequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> RequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: &str) -> RequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: &str) -> RequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    pub fn head(&self, path: &str) -> RequestBuilder<'_> {
        self.request(Method::HEAD, path)
    }

    pub fn options(&self, path: &str) -> RequestBuilder<'_> {
        self.request(Method::OPTIONS, path)
    }

    /// Dispatches an already-built request under the client's policies.
    pub async fn execute(&self, request: Request) -> ApiResult<Response> {
        self.dispatch(request, None).await
    }

    pub(crate) async fn dispatch(
        &self,
        request: Request,
        retry_override: Option<RetryPolicy>,
    ) -> ApiResult<Response> {
        let retry_policy = retry_override.unwrap_or_else(|| self.retry_policy.clone());
        self.metrics.record_request_started();
        let _in_flight = self.metrics.enter_in_flight();

        let mut context = RequestContext {
            method: request.method().clone(),
            url: request.url().to_string(),
            attempts: 0,
            max_attempts: retry_policy.max_attempts_value(),
        };

        // Interceptors shape headers once; the request then freezes and
        // every attempt replays it verbatim.
        let request = if self.interceptors.is_empty() {
            request
        } else {
            let mut headers = request.headers().clone();
            for interceptor in &self.interceptors {
                interceptor.on_request(&context, &mut headers);
            }
            request.with_headers(headers)
        };

        let key = cache_key(request.method(), request.url());
        let use_cache = self.cache.is_some() && request.method() == Method::GET;
        if use_cache
            && let Some(cache) = &self.cache
            && let Some(hit) = cache.lookup(&key)
        {
            self.metrics.record_cache_hit();
            debug!(url = %context.url, "cache hit, skipping dispatch");
            return Ok(hit);
        }

        let started = Instant::now();
        let result = self.run_attempts(&request, &retry_policy).await;
        self.metrics.record_outcome(&result, started.elapsed());

        match &result {
            Ok(response) => {
                context.attempts = response.attempts();
                for interceptor in &self.interceptors {
                    interceptor.on_response(&context, response);
                }
                if use_cache
                    && response.is_success()
                    && let Some(cache) = &self.cache
                {
                    cache.store(key, response.clone());
                }
            }
            Err(error) => {
                context.attempts = error.attempts().unwrap_or(context.max_attempts);
                for interceptor in &self.interceptors {
                    interceptor.on_error(&context, error);
                }
            }
        }
        result
    }

    async fn run_attempts(&self, request: &Request, policy: &RetryPolicy) -> ApiResult<Response> {
        let max_attempts = policy.max_attempts_value();
        let redacted = redact_uri_for_logs(request.url());
        let mut attempt = 1u32;
        loop {
            if let Some(limiter) = &self.rate_limiter {
                let mut waited = Duration::ZERO;
                loop {
                    let delay = limiter.acquire_delay(1.0);
                    if delay.is_zero() {
                        break;
                    }
                    waited += delay;
                    sleep(delay).await;
                }
                if !waited.is_zero() {
                    self.metrics.record_rate_limit_wait(waited);
                    debug!(
                        url = %redacted,
                        waited_ms = waited.as_millis() as u64,
                        "rate limiter delayed request"
                    );
                }
            }

            let span = info_span!(
                "apix.request",
                method = %request.method(),
                url = %redacted,
                attempt,
                max_attempts
            );
            let outcome = self.transport.attempt(request, attempt).instrument(span).await;

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    // A 429's hint throttles the shared limiter so
                    // concurrent callers back off too.
                    if status == StatusCode::TOO_MANY_REQUESTS
                        && let Some(limiter) = &self.rate_limiter
                        && let Some(hint) =
                            parse_retry_after(response.headers(), SystemTime::now())
                    {
                        limiter.observe_retry_after(policy.clamp_retry_after(hint));
                    }
                    let decision = RetryDecision {
                        attempt,
                        max_attempts,
                        method: request.method().clone(),
                        status: Some(status),
                        error_kind: None,
                    };
                    if policy.should_retry(&decision) {
                        let delay = parse_retry_after(response.headers(), SystemTime::now())
                            .map(|hint| policy.clamp_retry_after(hint))
                            .unwrap_or_else(|| policy.delay_for(attempt - 1));
                        warn!(
                            url = %redacted,
                            status = status.as_u16(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying after retryable status"
                        );
                        self.metrics.record_retry();
                        if !delay.is_zero() {
                            sleep(delay).await;
                        }
                        attempt += 1;
                        continue;
                    }
                    // A retryable status that ran out of budget (or was
                    // gated by the method list's absence) escalates; any
                    // other status is handed back as a plain response.
                    if !status.is_success()
                        && policy.is_retryable_status(status)
                        && policy.is_retryable_method(request.method())
                    {
                        return Err(error_from_response(response));
                    }
                    return Ok(response);
                }
                Err(error) => {
                    let decision = RetryDecision {
                        attempt,
                        max_attempts,
                        method: request.method().clone(),
                        status: None,
                        error_kind: Some(error.kind()),
                    };
                    if policy.should_retry(&decision) {
                        let delay = policy.delay_for(attempt - 1);
                        warn!(
                            url = %redacted,
                            error = %error,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying after transport error"
                        );
                        self.metrics.record_retry();
                        if !delay.is_zero() {
                            sleep(delay).await;
                        }
                        attempt += 1;
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }
}

/// Fluent request surface returned by [`Client::get`] and friends.
pub struct RequestBuilder<'a> {
    client: &'a Client,
    parts: RequestParts,
    retry_override: Option<RetryPolicy>,
}

impl<'a> RequestBuilder<'a> {
    pub fn query_pair(mut self, key: &str, value: &str) -> Self {
        self.parts.query_pair(key, value);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.parts.header(name, value);
        self
    }

    /// Serializes `value` as the JSON body. Serialization happens now, so
    /// retries reuse identical bytes.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        self.parts.json(value);
        self
    }

    pub fn form<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        self.parts.form(value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>, content_type: &'static str) -> Self {
        self.parts.raw_body(body.into(), content_type);
        self
    }

    /// Per-attempt timeout for this request only.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.parts.timeout(timeout);
        self
    }

    /// Retry policy for this request only.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_override = Some(retry_policy);
        self
    }

    /// Freezes the request without sending it.
    pub fn build(self) -> Result<Request, ConfigError> {
        self.parts.assemble(
            &self.client.base_url,
            &self.client.default_headers,
            self.client.timeout,
        )
    }

    pub async fn send(self) -> ApiResult<Response> {
        let request = self
            .parts
            .assemble(
                &self.client.base_url,
                &self.client.default_headers,
                self.client.timeout,
            )
            .map_err(invalid_request_error)?;
        self.client.dispatch(request, self.retry_override).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_bad_base_urls() {
        assert!(matches!(
            Client::builder("ftp://example.com").try_build(),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
        assert!(matches!(
            Client::builder("not a url").try_build(),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
        assert!(Client::builder("https://api.example.com").try_build().is_ok());
    }

    #[test]
    fn default_user_agent_is_applied() {
        let client = Client::builder("https://api.example.com")
            .try_build()
            .unwrap();
        let request = client.get("/x").build().unwrap();
        assert_eq!(
            request.headers().get(header::USER_AGENT).unwrap(),
            DEFAULT_USER_AGENT
        );
    }

    #[test]
    fn custom_user_agent_and_headers_flow_into_requests() {
        let client = Client::builder("https://api.example.com")
            .user_agent("svc/2.1")
            .default_header("x-api-key", "k1")
            .try_build()
            .unwrap();
        let request = client
            .post("/items")
            .header("x-trace", "t1")
            .build()
            .unwrap();
        assert_eq!(request.headers().get(header::USER_AGENT).unwrap(), "svc/2.1");
        assert_eq!(request.headers().get("x-api-key").unwrap(), "k1");
        assert_eq!(request.headers().get("x-trace").unwrap(), "t1");
    }

    #[test]
    fn request_paths_resolve_against_base_url() {
        let client = Client::builder("https://api.example.com/v2/")
            .try_build()
            .unwrap();
        let request = client
            .get("/users")
            .query_pair("active", "true")
            .build()
            .unwrap();
        assert_eq!(
            request.url().to_string(),
            "https://api.example.com/v2/users?active=true"
        );
    }

    #[test]
    fn clones_share_metrics() {
        let client = Client::builder("https://api.example.com")
            .try_build()
            .unwrap();
        let clone = client.clone();
        client.metrics.record_retry();
        assert_eq!(clone.metrics().snapshot().retries, 1);
    }
}
