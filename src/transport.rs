use std::time::Instant;

use bytes::{Bytes, BytesMut};
use http::header::HOST;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;

use crate::client::PoolConfig;
use crate::error::{ApiError, ApiResult, ConfigError, NetworkErrorKind};
use crate::request::Request;
use crate::response::Response;

type Connector = hyper_rustls::HttpsConnector<HttpConnector>;
type HyperClient = hyper_util::client::legacy::Client<Connector, Full<Bytes>>;

/// One HTTP exchange over a pooled hyper client. All retry, rate-limit,
/// and classification-of-status concerns live above this layer; the
/// transport reports exactly what happened to a single attempt.
#[derive(Clone)]
pub(crate) struct Transport {
    client: HyperClient,
}

enum AttemptFailure {
    Send(hyper_util::client::legacy::Error),
    Read(hyper::Error),
}

impl Transport {
    pub(crate) fn new(pool: &PoolConfig) -> Result<Self, ConfigError> {
        let tls = hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| ConfigError::Tls {
                source: Box::new(source),
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        let client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
            .pool_idle_timeout(pool.idle_timeout)
            .pool_max_idle_per_host(pool.max_idle_per_host)
            .build(tls);

        Ok(Transport { client })
    }

    /// Runs a single attempt under the request's deadline. The timeout
    /// covers connect, send, and the full body read.
    pub(crate) async fn attempt(&self, request: &Request, attempt: u32) -> ApiResult<Response> {
        let started = Instant::now();
        let http_request = build_http_request(request)?;

        let outcome = timeout(request.timeout(), async {
            let response = self
                .client
                .request(http_request)
                .await
                .map_err(AttemptFailure::Send)?;
            let (parts, body) = response.into_parts();
            let body = read_body(body).await.map_err(AttemptFailure::Read)?;
            Ok::<_, AttemptFailure>((parts, body))
        })
        .await;

        match outcome {
            Err(_elapsed) => Err(ApiError::Timeout {
                timeout: request.timeout(),
                attempts: attempt,
                message: format!(
                    "request timed out after {:.1}s: {} {}",
                    request.timeout().as_secs_f64(),
                    request.method(),
                    request.url()
                ),
                request: Some(request.clone()),
            }),
            Ok(Err(AttemptFailure::Send(source))) => {
                let kind = classify_send_error(&source);
                Err(ApiError::Network {
                    kind,
                    message: format!(
                        "network error ({kind}) for {} {}: {source}",
                        request.method(),
                        request.url()
                    ),
                    request: Some(request.clone()),
                    source: Some(Box::new(source)),
                })
            }
            Ok(Err(AttemptFailure::Read(source))) => Err(ApiError::Network {
                kind: NetworkErrorKind::Read,
                message: format!(
                    "failed reading response body for {} {}: {source}",
                    request.method(),
                    request.url()
                ),
                request: Some(request.clone()),
                source: Some(Box::new(source)),
            }),
            Ok(Ok((parts, body))) => Ok(Response::new(
                parts.status,
                parts.headers,
                body,
                started.elapsed(),
                attempt,
                request.clone(),
            )),
        }
    }
}

fn build_http_request(request: &Request) -> ApiResult<http::Request<Full<Bytes>>> {
    let mut builder = http::Request::builder()
        .method(request.method().clone())
        .uri(request.url().clone());
    if let Some(headers) = builder.headers_mut() {
        *headers = request.headers().clone();
        if !headers.contains_key(HOST)
            && let Some(authority) = request.url().authority()
            && let Ok(value) = authority.as_str().parse()
        {
            headers.insert(HOST, value);
        }
    }
    builder
        .body(Full::new(request.body().bytes()))
        .map_err(|source| ApiError::Network {
            kind: NetworkErrorKind::Other,
            message: format!(
                "failed to build http request for {} {}: {source}",
                request.method(),
                request.url()
            ),
            request: Some(request.clone()),
            source: Some(Box::new(source)),
        })
}

async fn read_body(mut body: Incoming) -> Result<Bytes, hyper::Error> {
    let mut buffer = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = frame?;
        if let Some(chunk) = frame.data_ref() {
            buffer.extend_from_slice(chunk);
        }
    }
    Ok(buffer.freeze())
}

fn classify_send_error(error: &hyper_util::client::legacy::Error) -> NetworkErrorKind {
    classify_error_text(&error_chain_text(error), error.is_connect())
}

/// Keyword classification over the rendered error chain. hyper's legacy
/// client only distinguishes connect errors structurally, so DNS and TLS
/// failures are recognized by their messages.
fn classify_error_text(text: &str, is_connect: bool) -> NetworkErrorKind {
    let dns = ["dns error", "failed to lookup", "name or service not known", "no such host"];
    let tls = ["tls", "certificate", "handshake", "unexpectedeof"];
    let read = ["incomplete message", "connection reset", "broken pipe", "body error"];

    if dns.iter().any(|needle| text.contains(needle)) {
        return NetworkErrorKind::Dns;
    }
    if tls.iter().any(|needle| text.contains(needle)) {
        return NetworkErrorKind::Tls;
    }
    if is_connect {
        return NetworkErrorKind::Connect;
    }
    if read.iter().any(|needle| text.contains(needle)) {
        return NetworkErrorKind::Read;
    }
    NetworkErrorKind::Other
}

fn error_chain_text(error: &(dyn std::error::Error + 'static)) -> String {
    let mut text = error.to_string().to_lowercase();
    let mut source = error.source();
    while let Some(inner) = source {
        text.push(' ');
        text.push_str(&inner.to_string().to_lowercase());
        source = inner.source();
    }
    text
}
