use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::{ApiError, ApiResult, error_from_response};
use crate::request::Request;
use crate::util::body_snippet;

/// A fully buffered response, paired with the request that produced it.
///
/// `attempts` counts every transport invocation made for this request,
/// including the one that returned this response.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    elapsed: Duration,
    attempts: u32,
    request: Request,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        elapsed: Duration,
        attempts: u32,
        request: Request,
    ) -> Self {
        Response {
            status,
            headers,
            body,
            elapsed,
            attempts,
            request,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Wall-clock time for the winning attempt, header to last body byte.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Transport invocations spent on this request, retries included.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> ApiResult<T> {
        serde_json::from_slice(&self.body).map_err(|source| {
            let method = self.request.method();
            let url = self.request.url();
            ApiError::Validation {
                message: format!(
                    "failed to decode JSON response for {method} {url}: {source}; body: {}",
                    body_snippet(&self.body)
                ),
                field_errors: Default::default(),
                request: Some(self.request.clone()),
                response: Some(self.clone()),
            }
        })
    }

    /// Escalates a non-success status into the matching [`ApiError`]
    /// variant; passes 1xx-3xx responses through untouched.
    pub fn error_for_status(self) -> ApiResult<Self> {
        if self.status.as_u16() < 400 {
            Ok(self)
        } else {
            Err(error_from_response(self))
        }
    }
}
