use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use http::StatusCode;
use thiserror::Error;

use crate::request::Request;
use crate::response::Response;
use crate::util::{body_snippet, parse_retry_after};

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Convenience alias for fallible client operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Every way a dispatched request can fail.
///
/// The set of variants is closed on purpose: callers match exhaustively and
/// the compiler flags every call site when a new failure mode is added.
/// Each variant carries the originating [`Request`] when one was frozen
/// before the failure, and the final [`Response`] when the failure was an
/// HTTP status rather than a transport problem.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Connection-level failure: DNS, connect, TLS, or a broken read.
    #[error("{message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        request: Option<Request>,
        #[source]
        source: Option<BoxError>,
    },

    /// The per-attempt deadline elapsed before a full response arrived.
    #[error("{message}")]
    Timeout {
        timeout: Duration,
        attempts: u32,
        message: String,
        request: Option<Request>,
    },

    /// HTTP 429, with the server's `Retry-After` hint when it sent one.
    #[error("{message}")]
    RateLimit {
        retry_after: Option<Duration>,
        message: String,
        request: Option<Request>,
        response: Option<Response>,
    },

    /// HTTP 401: missing or bad credentials.
    #[error("{message}")]
    Authentication {
        message: String,
        request: Option<Request>,
        response: Option<Response>,
    },

    /// HTTP 403: authenticated but not allowed.
    #[error("{message}")]
    Authorization {
        message: String,
        request: Option<Request>,
        response: Option<Response>,
    },

    /// HTTP 400 and other non-retryable client errors. `field_errors` holds
    /// per-field messages when the body carried a recognizable error map.
    #[error("{message}")]
    Validation {
        message: String,
        field_errors: BTreeMap<String, String>,
        request: Option<Request>,
        response: Option<Response>,
    },

    /// HTTP 5xx. `retry_possible` is false for statuses that will not heal
    /// on their own (501 Not Implemented, 505 Version Not Supported).
    #[error("{message}")]
    Server {
        status: u16,
        retry_possible: bool,
        attempts: u32,
        message: String,
        request: Option<Request>,
        response: Option<Response>,
    },
}

/// Fieldless mirror of [`ApiError`] for metrics keys and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ApiErrorKind {
    Network,
    Timeout,
    RateLimit,
    Authentication,
    Authorization,
    Validation,
    Server,
}

impl ApiErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorKind::Network => "network",
            ApiErrorKind::Timeout => "timeout",
            ApiErrorKind::RateLimit => "rate_limit",
            ApiErrorKind::Authentication => "authentication",
            ApiErrorKind::Authorization => "authorization",
            ApiErrorKind::Validation => "validation",
            ApiErrorKind::Server => "server",
        }
    }
}

impl std::fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What went wrong below the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NetworkErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl NetworkErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkErrorKind::Dns => "dns",
            NetworkErrorKind::Connect => "connect",
            NetworkErrorKind::Tls => "tls",
            NetworkErrorKind::Read => "read",
            NetworkErrorKind::Other => "other",
        }
    }
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ApiError {
    pub fn kind(&self) -> ApiErrorKind {
        match self {
            ApiError::Network { .. } => ApiErrorKind::Network,
            ApiError::Timeout { .. } => ApiErrorKind::Timeout,
            ApiError::RateLimit { .. } => ApiErrorKind::RateLimit,
            ApiError::Authentication { .. } => ApiErrorKind::Authentication,
            ApiError::Authorization { .. } => ApiErrorKind::Authorization,
            ApiError::Validation { .. } => ApiErrorKind::Validation,
            ApiError::Server { .. } => ApiErrorKind::Server,
        }
    }

    /// The HTTP status that produced this error, when there was one.
    pub fn status(&self) -> Option<StatusCode> {
        self.response().map(Response::status)
    }

    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Network { .. } | ApiError::Timeout { .. } | ApiError::RateLimit { .. } => {
                true
            }
            ApiError::Server { retry_possible, .. } => *retry_possible,
            ApiError::Authentication { .. }
            | ApiError::Authorization { .. }
            | ApiError::Validation { .. } => false,
        }
    }

    /// Transport invocations spent before this error, where the variant
    /// records them.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ApiError::Timeout { attempts, .. } | ApiError::Server { attempts, .. } => {
                Some(*attempts)
            }
            _ => self.response().map(Response::attempts),
        }
    }

    pub fn request(&self) -> Option<&Request> {
        match self {
            ApiError::Network { request, .. }
            | ApiError::Timeout { request, .. }
            | ApiError::RateLimit { request, .. }
            | ApiError::Authentication { request, .. }
            | ApiError::Authorization { request, .. }
            | ApiError::Validation { request, .. }
            | ApiError::Server { request, .. } => request.as_ref(),
        }
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            ApiError::Network { .. } | ApiError::Timeout { .. } => None,
            ApiError::RateLimit { response, .. }
            | ApiError::Authentication { response, .. }
            | ApiError::Authorization { response, .. }
            | ApiError::Validation { response, .. }
            | ApiError::Server { response, .. } => response.as_ref(),
        }
    }
}

/// Converts a non-success response into the matching [`ApiError`] variant.
///
/// Statuses without a variant of their own (404, 410, ...) land on
/// `Validation` with an empty field map; the embedded response preserves
/// the real status for callers that need it.
pub(crate) fn error_from_response(response: Response) -> ApiError {
    let status = response.status();
    let method = response.request().method().clone();
    let url = response.request().url().clone();
    let request = Some(response.request().clone());

    match status.as_u16() {
        401 => ApiError::Authentication {
            message: format!("authentication failed (401) for {method} {url}"),
            request,
            response: Some(response),
        },
        403 => ApiError::Authorization {
            message: format!("access forbidden (403) for {method} {url}"),
            request,
            response: Some(response),
        },
        429 => {
            let retry_after = parse_retry_after(response.headers(), SystemTime::now());
            let hint = match retry_after {
                Some(wait) => format!(", retry after {:.1}s", wait.as_secs_f64()),
                None => String::new(),
            };
            ApiError::RateLimit {
                retry_after,
                message: format!("rate limited (429) for {method} {url}{hint}"),
                request,
                response: Some(response),
            }
        }
        code @ 500..=599 => {
            let attempts = response.attempts();
            ApiError::Server {
                status: code,
                retry_possible: !matches!(code, 501 | 505),
                attempts,
                message: format!(
                    "server error ({code}) for {method} {url} after {attempts} attempt(s)"
                ),
                request,
                response: Some(response),
            }
        }
        code => {
            let field_errors = parse_field_errors(response.body());
            let snippet = body_snippet(response.body());
            let detail = if snippet.is_empty() {
                String::new()
            } else {
                format!(": {snippet}")
            };
            ApiError::Validation {
                message: format!("request rejected ({code}) for {method} {url}{detail}"),
                field_errors,
                request,
                response: Some(response),
            }
        }
    }
}

/// Maps a request-assembly failure onto the dispatch taxonomy. An
/// unbuildable request is a validation failure from the caller's point of
/// view; nothing was sent.
pub(crate) fn invalid_request_error(error: ConfigError) -> ApiError {
    ApiError::Validation {
        message: format!("invalid request: {error}"),
        field_errors: BTreeMap::new(),
        request: None,
        response: None,
    }
}

/// Pulls a `{"errors": {"field": "message"}}` map out of an error body.
///
/// Also accepts the flattened form where `errors` maps fields to arrays of
/// messages, in which case the first message wins. Anything else yields an
/// empty map.
pub(crate) fn parse_field_errors(body: &[u8]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return out;
    };
    let Some(errors) = value.get("errors").and_then(|v| v.as_object()) else {
        return out;
    };
    for (field, detail) in errors {
        let message = match detail {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Array(items) => items
                .first()
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            _ => None,
        };
        if let Some(message) = message {
            out.insert(field.clone(), message);
        }
    }
    out
}

/// Failures while assembling a client or a request, before anything is
/// sent. Kept apart from [`ApiError`] so the dispatch taxonomy stays
/// closed over runtime failures only.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid base URL: {url}")]
    InvalidBaseUrl { url: String },

    #[error("invalid request URL: {url}")]
    InvalidUrl { url: String },

    #[error("invalid header name: {name}")]
    InvalidHeaderName { name: String },

    #[error("invalid value for header {name}")]
    InvalidHeaderValue { name: String },

    #[error("failed to serialize JSON body")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize form body")]
    SerializeForm {
        #[source]
        source: serde_urlencoded::ser::Error,
    },

    #[error("failed to initialize TLS transport")]
    Tls {
        #[source]
        source: BoxError,
    },
}
