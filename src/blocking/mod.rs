//! Blocking twin of the async client, for callers without a runtime.
//!
//! Policies, the error taxonomy, and retry semantics are identical; only
//! the transport (ureq) and the waiting (`thread::sleep`) differ.

mod transport;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, header};
use serde::Serialize;
use tracing::{debug, info_span, warn};

use crate::cache::{ResponseCache, cache_key};
use crate::client::{DEFAULT_TIMEOUT, DEFAULT_USER_AGENT, PoolConfig};
use crate::error::{ApiResult, ConfigError, error_from_response, invalid_request_error};
use crate::metrics::ClientMetrics;
use crate::policy::{Interceptor, RequestContext};
use crate::rate_limit::{RateLimitPolicy, RateLimiter};
use crate::request::{Request, RequestParts};
use crate::response::Response;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::util::{parse_header_name, parse_header_value, parse_retry_after, redact_uri_for_logs};

/// Configures and builds a blocking [`Client`].
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

    pub fn default_header(mut self, name: &str, value: &str) -> Self {
        self.default_headers
            .push((name.to_string(), value.to_string()));
        self
    }

    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = Some(policy);
        self
    }

    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
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

        let agent = transport::build_agent(&self.user_agent, &self.pool);

        Ok(Client {
            base_url: self.base_url,
            default_headers,
            timeout: self.timeout,
            retry_policy: self.retry_policy,
            rate_limiter: self.rate_limit.map(|policy| Arc::new(RateLimiter::new(policy))),
            cache: self.cache,
            interceptors: self.interceptors,
            agent,
            metrics: ClientMetrics::default(),
        })
    }
}

/// Blocking HTTP API client. Clones share the connection pool, rate
/// limiter, cache, and metrics; hand them to worker threads freely.
#[derive(Clone)]
pub struct Client {
    base_url: String,
    default_headers: HeaderMap,
    timeout: Duration,
    retry_policy: RetryPolicy,
    rate_limiter: Option<Arc<RateLimiter>>,
    cache: Option<Arc<ResponseCache>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    agent: ureq::Agent,
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
    pub fn execute(&self, request: Request) -> ApiResult<Response> {
        self.dispatch(request, None)
    }

    fn dispatch(&self, request: Request, retry_override: Option<RetryPolicy>) -> ApiResult<Response> {
        let retry_policy = retry_override.unwrap_or_else(|| self.retry_policy.clone());
        self.metrics.record_request_started();
        let _in_flight = self.metrics.enter_in_flight();

        let mut context = RequestContext {
            method: request.method().clone(),
            url: request.url().to_string(),
            attempts: 0,
            max_attempts: retry_policy.max_attempts_value(),
        };

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
        let result = self.run_attempts(&request, &retry_policy);
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

    fn run_attempts(&self, request: &Request, policy: &RetryPolicy) -> ApiResult<Response> {
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
                    thread::sleep(delay);
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
            let _enter = span.enter();

            match transport::attempt(&self.agent, request, attempt) {
                Ok(response) => {
                    let status = response.status();
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
                            status = status.as_u16(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying after retryable status"
                        );
                        self.metrics.record_retry();
                        if !delay.is_zero() {
                            thread::sleep(delay);
                        }
                        attempt += 1;
                        continue;
                    }
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
                            error = %error,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying after transport error"
                        );
                        self.metrics.record_retry();
                        if !delay.is_zero() {
                            thread::sleep(delay);
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

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.parts.timeout(timeout);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_override = Some(retry_policy);
        self
    }

    pub fn build(self) -> Result<Request, ConfigError> {
        self.parts.assemble(
            &self.client.base_url,
            &self.client.default_headers,
            self.client.timeout,
        )
    }

    /// Sends the request, blocking until the retry loop settles.
    pub fn call(self) -> ApiResult<Response> {
        let request = self
            .parts
            .assemble(
                &self.client.base_url,
                &self.client.default_headers,
                self.client.timeout,
            )
            .map_err(invalid_request_error)?;
        self.client.dispatch(request, self.retry_override)
    }
}
