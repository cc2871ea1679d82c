use std::io::{self, Read};
use std::time::Instant;

use bytes::Bytes;

use crate::client::PoolConfig;
use crate::error::{ApiError, ApiResult, NetworkErrorKind};
use crate::request::Request;
use crate::response::Response;

pub(crate) fn build_agent(user_agent: &str, pool: &PoolConfig) -> ureq::Agent {
    ureq::Agent::config_builder()
        .http_status_as_error(false)
        .user_agent(user_agent)
        .max_idle_age(pool.idle_timeout)
        .max_idle_connections_per_host(pool.max_idle_per_host)
        .build()
        .new_agent()
}

/// One synchronous HTTP exchange. Non-2xx statuses come back as plain
/// responses; only transport-level failures become errors here.
pub(crate) fn attempt(agent: &ureq::Agent, request: &Request, attempt: u32) -> ApiResult<Response> {
    let started = Instant::now();

    let mut builder = ureq::http::Request::builder()
        .method(request.method().clone())
        .uri(request.url().to_string());
    if let Some(headers) = builder.headers_mut() {
        *headers = request.headers().clone();
    }
    let http_request = builder
        .body(request.body().bytes().to_vec())
        .map_err(|source| ApiError::Network {
            kind: NetworkErrorKind::Other,
            message: format!(
                "failed to build http request for {} {}: {source}",
                request.method(),
                request.url()
            ),
            request: Some(request.clone()),
            source: Some(Box::new(source)),
        })?;
    let http_request = agent
        .configure_request(http_request)
        .timeout_global(Some(request.timeout()))
        .build();

    let mut response = match agent.run(http_request) {
        Ok(response) => response,
        Err(ureq::Error::Timeout(_)) => return Err(timeout_error(request, attempt)),
        Err(source) => {
            let kind = classify_transport_error(&source);
            return Err(ApiError::Network {
                kind,
                message: format!(
                    "network error ({kind}) for {} {}: {source}",
                    request.method(),
                    request.url()
                ),
                request: Some(request.clone()),
                source: Some(Box::new(source)),
            });
        }
    };

    let status = response.status();
    let headers = response.headers().clone();
    let mut body = Vec::new();
    match response.body_mut().as_reader().read_to_end(&mut body) {
        Ok(_) => {}
        Err(source) if source.kind() == io::ErrorKind::TimedOut => {
            return Err(timeout_error(request, attempt));
        }
        Err(source) => {
            return Err(ApiError::Network {
                kind: NetworkErrorKind::Read,
                message: format!(
                    "failed reading response body for {} {}: {source}",
                    request.method(),
                    request.url()
                ),
                request: Some(request.clone()),
                source: Some(Box::new(source)),
            });
        }
    }

    Ok(Response::new(
        status,
        headers,
        Bytes::from(body),
        started.elapsed(),
        attempt,
        request.clone(),
    ))
}

fn timeout_error(request: &Request, attempt: u32) -> ApiError {
    ApiError::Timeout {
        timeout: request.timeout(),
        attempts: attempt,
        message: format!(
            "request timed out after {:.1}s: {} {}",
            request.timeout().as_secs_f64(),
            request.method(),
            request.url()
        ),
        request: Some(request.clone()),
    }
}

fn classify_transport_error(error: &ureq::Error) -> NetworkErrorKind {
    match error {
        ureq::Error::HostNotFound => NetworkErrorKind::Dns,
        ureq::Error::ConnectionFailed => NetworkErrorKind::Connect,
        ureq::Error::Io(source) => classify_io_error(source),
        other => {
            let text = other.to_string().to_lowercase();
            if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
                NetworkErrorKind::Tls
            } else {
                NetworkErrorKind::Other
            }
        }
    }
}

fn classify_io_error(error: &io::Error) -> NetworkErrorKind {
    match error.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotConnected => {
            NetworkErrorKind::Connect
        }
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => NetworkErrorKind::Read,
        _ => NetworkErrorKind::Other,
    }
}
