use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use http::{HeaderMap, HeaderName, HeaderValue, Uri};

use crate::error::ConfigError;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Overlays `extra` on top of `base`. Later values win on name collisions.
pub(crate) fn merge_headers(base: &HeaderMap, extra: &HeaderMap) -> HeaderMap {
    let mut merged = base.clone();
    for (name, value) in extra {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, ConfigError> {
    name.parse::<HeaderName>()
        .map_err(|_| ConfigError::InvalidHeaderName {
            name: name.to_string(),
        })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, ConfigError> {
    value
        .parse::<HeaderValue>()
        .map_err(|_| ConfigError::InvalidHeaderValue {
            name: name.to_string(),
        })
}

/// Joins a request path onto the configured base URL.
///
/// Absolute `http`/`https` paths bypass the base entirely, matching what
/// callers expect when an API returns fully-qualified follow-up links.
pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if path.is_empty() {
        return base.to_string();
    }
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

pub(crate) fn append_query_pairs(url: &str, pairs: &[(String, String)]) -> String {
    if pairs.is_empty() {
        return url.to_string();
    }

    let (head, fragment) = match url.split_once('#') {
        Some((head, tail)) => (head, Some(tail)),
        None => (url, None),
    };

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    let encoded = serializer.finish();

    let separator = if head.contains('?') { '&' } else { '?' };
    let mut out = format!("{head}{separator}{encoded}");
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

pub(crate) fn parse_url(url: &str) -> Result<Uri, ConfigError> {
    let parsed = url.parse::<Uri>().map_err(|_| ConfigError::InvalidUrl {
        url: url.to_string(),
    })?;
    match parsed.scheme_str() {
        Some("http") | Some("https") => {}
        _ => {
            return Err(ConfigError::InvalidUrl {
                url: url.to_string(),
            });
        }
    }
    if parsed.host().is_none() {
        return Err(ConfigError::InvalidUrl {
            url: url.to_string(),
        });
    }
    Ok(parsed)
}

/// Parses a `Retry-After` response header into a wait duration.
///
/// Handles the delta-seconds form first and falls back to the HTTP-date
/// form. A date already in the past yields a zero duration rather than
/// `None` so callers still honor the header over computed backoff.
pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let raw = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = httpdate::parse_http_date(raw).ok()?;
    Some(date.duration_since(now).unwrap_or(Duration::ZERO))
}

/// Strips query string and userinfo before a URI reaches the logs.
pub(crate) fn redact_uri_for_logs(uri: &Uri) -> String {
    let scheme = uri.scheme_str().unwrap_or("http");
    let host = uri.host().unwrap_or("");
    let path = uri.path();
    match uri.port_u16() {
        Some(port) => format!("{scheme}://{host}:{port}{path}"),
        None => format!("{scheme}://{host}{path}"),
    }
}

const SNIPPET_LIMIT: usize = 2048;

/// Truncates a response body for inclusion in error messages.
pub(crate) fn body_snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= SNIPPET_LIMIT {
        return text.into_owned();
    }
    let truncated: String = text.chars().take(SNIPPET_LIMIT).collect();
    format!("{truncated}... (truncated)")
}
