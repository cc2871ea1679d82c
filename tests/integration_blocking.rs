//! End-to-end tests for the blocking client.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use apix::blocking::Client;
use apix::{ApiError, RateLimitPolicy, RetryPolicy};

struct MockResponse {
    status: u16,
    body: String,
    delay: Duration,
}

impl MockResponse {
    fn new(status: u16, body: &str) -> Self {
        MockResponse {
            status,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Minimal scripted HTTP/1.1 server; the last response repeats.
struct MockServer {
    addr: std::net::SocketAddr,
    served: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<MockResponse>) -> Self {
        assert!(!responses.is_empty());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();

        let served = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_served = Arc::clone(&served);
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            while !thread_shutdown.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(false).unwrap();
                        handle_connection(stream, &responses, &thread_served);
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });

        MockServer {
            addr,
            served,
            shutdown,
            handle: Some(handle),
        }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_connection(mut stream: TcpStream, responses: &[MockResponse], served: &AtomicUsize) {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(read) => {
                buffer.extend_from_slice(&chunk[..read]);
                if let Some(position) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                    break position;
                }
            }
            Err(_) => return,
        }
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).into_owned();
    let mut content_length = 0usize;
    for line in head.lines().skip(1) {
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
        {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }
    let mut body_read = buffer.len() - header_end - 4;
    while body_read < content_length {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => body_read += read,
            Err(_) => break,
        }
    }

    let index = served.fetch_add(1, Ordering::SeqCst).min(responses.len() - 1);
    let scripted = &responses[index];
    if !scripted.delay.is_zero() {
        thread::sleep(scripted.delay);
    }

    let out = format!(
        "HTTP/1.1 {} MOCK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        scripted.status,
        scripted.body.len(),
        scripted.body
    );
    let _ = stream.write_all(out.as_bytes());
    let _ = stream.flush();
}

fn fast_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::standard()
        .max_attempts(max_attempts)
        .initial_delay(Duration::from_millis(20))
        .jitter_ratio(0.0)
}

#[test]
fn get_success_roundtrip() {
    let server = MockServer::start(vec![MockResponse::new(200, r#"{"ok": true}"#)]);
    let client = Client::builder(server.url()).try_build().unwrap();

    let response = client.get("/health").call().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.attempts(), 1);
    let decoded: serde_json::Value = response.json().unwrap();
    assert_eq!(decoded["ok"], true);
}

#[test]
fn transient_503s_are_retried_until_success() {
    let server = MockServer::start(vec![
        MockResponse::new(503, "busy"),
        MockResponse::new(200, "recovered"),
    ]);
    let client = Client::builder(server.url())
        .retry_policy(fast_retries(3))
        .try_build()
        .unwrap();

    let response = client.get("/flaky").call().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.attempts(), 2);
    assert_eq!(server.served(), 2);
    assert_eq!(client.metrics().snapshot().retries, 1);
}

#[test]
fn exhausted_retries_surface_a_server_error() {
    let server = MockServer::start(vec![MockResponse::new(503, "down")]);
    let client = Client::builder(server.url())
        .retry_policy(fast_retries(3))
        .try_build()
        .unwrap();

    let error = client.get("/down").call().unwrap_err();
    match &error {
        ApiError::Server {
            status, attempts, ..
        } => {
            assert_eq!(*status, 503);
            assert_eq!(*attempts, 3);
        }
        other => panic!("expected Server error, got {other:?}"),
    }
    assert_eq!(server.served(), 3);
}

#[test]
fn post_is_not_retried_on_503() {
    let server = MockServer::start(vec![
        MockResponse::new(503, "busy"),
        MockResponse::new(200, "never reached"),
    ]);
    let client = Client::builder(server.url())
        .retry_policy(fast_retries(3))
        .try_build()
        .unwrap();

    let response = client
        .post("/jobs")
        .json(&serde_json::json!({"kind": "import"}))
        .call()
        .unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(server.served(), 1);
}

#[test]
fn slow_response_times_out() {
    let server = MockServer::start(vec![
        MockResponse::new(200, "late").delay(Duration::from_millis(600)),
    ]);
    let client = Client::builder(server.url())
        .retry_policy(RetryPolicy::disabled())
        .try_build()
        .unwrap();

    let error = client
        .get("/slow")
        .timeout(Duration::from_millis(100))
        .call()
        .unwrap_err();
    match &error {
        ApiError::Timeout { attempts, .. } => assert_eq!(*attempts, 1),
        other => panic!("expected Timeout, got {other:?}"),
    }
}

#[test]
fn worker_threads_share_one_bucket() {
    let server = MockServer::start(vec![MockResponse::new(200, "ok")]);
    let client = Client::builder(server.url())
        .rate_limit(RateLimitPolicy::new(20.0).burst(1.0))
        .try_build()
        .unwrap();

    let started = Instant::now();
    let mut workers = Vec::new();
    for _ in 0..4 {
        let clone = client.clone();
        workers.push(thread::spawn(move || clone.get("/shared").call()));
    }
    for worker in workers {
        worker.join().unwrap().unwrap();
    }

    assert!(
        started.elapsed() >= Duration::from_millis(120),
        "threads did not share the limiter: {:?}",
        started.elapsed()
    );
    assert_eq!(server.served(), 4);
}
