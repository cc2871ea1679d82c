use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri, header};
use serde::Serialize;

use crate::error::ConfigError;
use crate::util::{
    append_query_pairs, join_base_path, merge_headers, parse_header_name, parse_header_value,
    parse_url,
};

/// A fully resolved request, frozen before the first attempt.
///
/// Every retry of this request reuses the same method, URL, headers, body,
/// and timeout. Builders produce it; nothing mutates it afterwards.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Uri,
    headers: HeaderMap,
    body: Body,
    timeout: Duration,
}

/// Request payload. JSON bodies are pre-serialized at build time so a
/// retry never re-serializes (and never observes a changed value).
#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    Json(Bytes),
    Raw(Bytes),
}

impl Body {
    pub fn bytes(&self) -> Bytes {
        match self {
            Body::Empty => Bytes::new(),
            Body::Json(bytes) | Body::Raw(bytes) => bytes.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

impl Request {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Replaces the header map, producing the effective frozen request.
    /// Used once, after interceptors have had their say.
    pub(crate) fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    #[cfg(test)]
    pub(crate) fn test_stub(method: Method, url: &str) -> Self {
        Request {
            method,
            url: url.parse().unwrap(),
            headers: HeaderMap::new(),
            body: Body::Empty,
            timeout: Duration::from_secs(30),
        }
    }
}

/// The accumulating state behind both the async and blocking request
/// builders. Serialization failures are parked here and surfaced when the
/// request is assembled, keeping the builder methods chainable.
#[derive(Debug)]
pub(crate) struct RequestParts {
    pub(crate) method: Method,
    pub(crate) path: String,
    query_pairs: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Body,
    content_type: Option<&'static str>,
    timeout: Option<Duration>,
    deferred_error: Option<ConfigError>,
}

impl RequestParts {
    pub(crate) fn new(method: Method, path: &str) -> Self {
        RequestParts {
            method,
            path: path.to_string(),
            query_pairs: Vec::new(),
            headers: Vec::new(),
            body: Body::Empty,
            content_type: None,
            timeout: None,
            deferred_error: None,
        }
    }

    pub(crate) fn query_pair(&mut self, key: &str, value: &str) {
        self.query_pairs.push((key.to_string(), value.to_string()));
    }

    pub(crate) fn header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub(crate) fn json<T: Serialize + ?Sized>(&mut self, value: &T) {
        match serde_json::to_vec(value) {
            Ok(encoded) => {
                self.body = Body::Json(Bytes::from(encoded));
                self.content_type = Some("application/json");
            }
            Err(source) => {
                self.deferred_error = Some(ConfigError::SerializeJson { source });
            }
        }
    }

    pub(crate) fn form<T: Serialize + ?Sized>(&mut self, value: &T) {
        match serde_urlencoded::to_string(value) {
            Ok(encoded) => {
                self.body = Body::Raw(Bytes::from(encoded));
                self.content_type = Some("application/x-www-form-urlencoded");
            }
            Err(source) => {
                self.deferred_error = Some(ConfigError::SerializeForm { source });
            }
        }
    }

    pub(crate) fn raw_body(&mut self, body: Bytes, content_type: &'static str) {
        self.body = Body::Raw(body);
        self.content_type = Some(content_type);
    }

    pub(crate) fn timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// Resolves this builder state against client defaults into a frozen
    /// [`Request`].
    pub(crate) fn assemble(
        self,
        base_url: &str,
        default_headers: &HeaderMap,
        default_timeout: Duration,
    ) -> Result<Request, ConfigError> {
        if let Some(error) = self.deferred_error {
            return Err(error);
        }

        let url = append_query_pairs(&join_base_path(base_url, &self.path), &self.query_pairs);
        let url = parse_url(&url)?;

        let mut extra = HeaderMap::new();
        if let Some(content_type) = self.content_type {
            extra.insert(header::CONTENT_TYPE, header::HeaderValue::from_static(content_type));
        }
        for (name, value) in &self.headers {
            let name = parse_header_name(name)?;
            let value = parse_header_value(name.as_str(), value)?;
            extra.insert(name, value);
        }

        Ok(Request {
            method: self.method,
            url,
            headers: merge_headers(default_headers, &extra),
            body: self.body,
            timeout: self.timeout.unwrap_or(default_timeout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Payload {
        name: String,
        count: u32,
    }

    fn defaults() -> (HeaderMap, Duration) {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "k123".parse().unwrap());
        (headers, Duration::from_secs(30))
    }

    #[test]
    fn assemble_resolves_url_and_defaults() {
        let (headers, timeout) = defaults();
        let mut parts = RequestParts::new(Method::GET, "/users");
        parts.query_pair("page", "2");

        let request = parts
            .assemble("https://api.example.com/v1", &headers, timeout)
            .unwrap();
        assert_eq!(
            request.url().to_string(),
            "https://api.example.com/v1/users?page=2"
        );
        assert_eq!(request.headers().get("x-api-key").unwrap(), "k123");
        assert_eq!(request.timeout(), Duration::from_secs(30));
        assert!(request.body().is_empty());
    }

    #[test]
    fn json_body_sets_content_type_once() {
        let (headers, timeout) = defaults();
        let mut parts = RequestParts::new(Method::POST, "/users");
        parts.json(&Payload {
            name: "ada".to_string(),
            count: 3,
        });

        let request = parts
            .assemble("https://api.example.com", &headers, timeout)
            .unwrap();
        assert_eq!(
            request.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = request.body().bytes();
        let decoded: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded["name"], "ada");
        assert_eq!(decoded["count"], 3);
    }

    #[test]
    fn form_body_urlencodes() {
        let (headers, timeout) = defaults();
        let mut parts = RequestParts::new(Method::POST, "/login");
        parts.form(&[("user", "a b"), ("pass", "x&y")]);

        let request = parts
            .assemble("https://api.example.com", &headers, timeout)
            .unwrap();
        assert_eq!(
            request.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded"
        );
        assert_eq!(&request.body().bytes()[..], b"user=a+b&pass=x%26y");
    }

    #[test]
    fn per_request_headers_override_defaults() {
        let (headers, timeout) = defaults();
        let mut parts = RequestParts::new(Method::GET, "/users");
        parts.header("x-api-key", "override");

        let request = parts
            .assemble("https://api.example.com", &headers, timeout)
            .unwrap();
        assert_eq!(request.headers().get("x-api-key").unwrap(), "override");
    }

    #[test]
    fn json_serialize_failure_surfaces_at_assemble() {
        let (headers, timeout) = defaults();
        let mut parts = RequestParts::new(Method::POST, "/items");
        // Non-string map keys cannot become JSON object keys.
        let bad: std::collections::BTreeMap<(u8, u8), u8> =
            [((1, 2), 3)].into_iter().collect();
        parts.json(&bad);

        let error = parts
            .assemble("https://api.example.com", &headers, timeout)
            .unwrap_err();
        assert!(matches!(error, ConfigError::SerializeJson { .. }));
    }

    #[test]
    fn invalid_header_name_surfaces_at_assemble() {
        let (headers, timeout) = defaults();
        let mut parts = RequestParts::new(Method::GET, "/users");
        parts.header("bad header", "v");

        let error = parts
            .assemble("https://api.example.com", &headers, timeout)
            .unwrap_err();
        assert!(matches!(error, ConfigError::InvalidHeaderName { .. }));
    }

    #[test]
    fn per_request_timeout_overrides_default() {
        let (headers, timeout) = defaults();
        let mut parts = RequestParts::new(Method::GET, "/slow");
        parts.timeout(Duration::from_secs(2));

        let request = parts
            .assemble("https://api.example.com", &headers, timeout)
            .unwrap();
        assert_eq!(request.timeout(), Duration::from_secs(2));
    }
}
