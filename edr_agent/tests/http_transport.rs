//! HTTP transport against an in-process axum server (plus raw sockets for transport failures).

mod common;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use flate2::read::GzDecoder;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use edr_agent::error::TransportError;
use edr_agent::http::HttpTransport;
use edr_agent::telemetry::gzip;

#[derive(Debug, Clone)]
struct Seen {
    path: String,
    auth: Option<String>,
    agent_id: Option<String>,
    encoding: Option<String>,
    body: Vec<u8>,
}

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<Seen>>>,
    polls: Arc<AtomicUsize>,
}

impl Recorder {
    fn record(&self, path: &str, headers: &HeaderMap, body: &[u8]) {
        let h = |k: &str| headers.get(k).and_then(|v| v.to_str().ok()).map(String::from);
        self.seen.lock().unwrap().push(Seen {
            path: path.to_string(),
            auth: h("authorization"),
            agent_id: h("x-agent-id"),
            encoding: h("content-encoding"),
            body: body.to_vec(),
        });
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

fn app(rec: Recorder) -> Router {
    Router::new()
        .route(
            "/api/v1/commands/poll/",
            get(|State(r): State<Recorder>, headers: HeaderMap| async move {
                r.record("poll", &headers, b"");
                match r.polls.fetch_add(1, Ordering::SeqCst) {
                    0 => (
                        StatusCode::OK,
                        r#"{"command_id":"c-1","type":"isolate_host","parameters":{}}"#.to_string(),
                    ),
                    1 => (StatusCode::OK, "{}".to_string()),
                    _ => (StatusCode::NO_CONTENT, String::new()),
                }
            }),
        )
        .route(
            "/api/v1/commands/result/:id/",
            post(
                |State(r): State<Recorder>, Path(id): Path<String>, headers: HeaderMap, body: Bytes| async move {
                    r.record(&format!("result/{id}"), &headers, &body);
                    StatusCode::OK
                },
            ),
        )
        .route(
            "/api/v1/telemetry/",
            post(|State(r): State<Recorder>, headers: HeaderMap, body: Bytes| async move {
                r.record("telemetry", &headers, &body);
                if headers.get("content-encoding").is_some() {
                    StatusCode::CREATED
                } else {
                    StatusCode::OK
                }
            }),
        )
        .route(
            "/accepted/",
            post(|| async { StatusCode::ACCEPTED }),
        )
        .route(
            "/broken/",
            post(|State(r): State<Recorder>, headers: HeaderMap, body: Bytes| async move {
                r.record("broken", &headers, &body);
                (StatusCode::INTERNAL_SERVER_ERROR, "boom")
            }),
        )
        .with_state(rec)
}

fn transport(addr: std::net::SocketAddr, api_path: &str) -> HttpTransport {
    HttpTransport::new(format!("http://{addr}"), api_path)
        .with_header("Authorization", "Token s3cret")
        .with_header("X-Agent-ID", "ws-042")
}

#[test]
fn poll_sequence_and_headers() {
    let rec = Recorder::default();
    let addr = common::spawn_server(app(rec.clone()));
    let t = transport(addr, "/api/v1/telemetry/");

    let first = t.poll_command().unwrap().expect("queued command");
    assert!(first.contains("\"command_id\":\"c-1\""));
    assert_eq!(t.poll_command().unwrap(), None, "{{}} means empty queue");
    assert_eq!(t.poll_command().unwrap(), None, "204 means empty queue");

    t.post_result("c-1", r#"{"status":"success","message":"Host isolated"}"#)
        .unwrap();

    let seen = rec.seen();
    assert_eq!(seen.len(), 4);
    for s in &seen {
        assert_eq!(s.auth.as_deref(), Some("Token s3cret"));
        assert_eq!(s.agent_id.as_deref(), Some("ws-042"));
    }
    assert_eq!(seen[3].path, "result/c-1");
    assert_eq!(
        String::from_utf8_lossy(&seen[3].body),
        r#"{"status":"success","message":"Host isolated"}"#
    );
}

#[test]
fn compressed_batch_is_gzip_and_accepted() {
    let rec = Recorder::default();
    let addr = common::spawn_server(app(rec.clone()));
    let t = transport(addr, "/api/v1/telemetry/");

    let payload = r#"[{"event_type":"process"},{"event_type":"process"}]"#;
    t.send_compressed_batch(&gzip(payload.as_bytes()).unwrap())
        .unwrap();
    t.send_event(r#"{"event_type":"process"}"#).unwrap();

    let seen = rec.seen();
    assert_eq!(seen[0].encoding.as_deref(), Some("gzip"));
    let mut body = String::new();
    GzDecoder::new(&seen[0].body[..])
        .read_to_string(&mut body)
        .unwrap();
    assert_eq!(body, payload);
    assert_eq!(seen[1].encoding, None);
}

#[test]
fn only_200_and_201_count_as_delivered() {
    let addr = common::spawn_server(app(Recorder::default()));
    let t = transport(addr, "/accepted/");
    match t.send_event("{}") {
        Err(TransportError::Status { code, .. }) => assert_eq!(code, 202),
        other => panic!("expected status error, got {other:?}"),
    }
}

#[test]
fn status_errors_are_not_retried() {
    let rec = Recorder::default();
    let addr = common::spawn_server(app(rec.clone()));
    let t = transport(addr, "/broken/");
    let err = t.send_compressed_batch(&gzip(b"[]").unwrap()).unwrap_err();
    assert!(matches!(err, TransportError::Status { code: 500, .. }));
    assert_eq!(rec.seen().len(), 1);
}

/// Accepts connections; the first `drop_first` are closed without a response.
fn flaky_server(drop_first: usize) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&accepted);
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let n = count.fetch_add(1, Ordering::SeqCst);
            let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(k) => buf.extend_from_slice(&chunk[..k]),
                }
            }
            if n < drop_first {
                drop(stream);
                continue;
            }
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}",
            );
        }
    });
    (addr, accepted)
}

#[test]
fn transport_failure_reconnects_and_retries_once() {
    let (addr, accepted) = flaky_server(1);
    let t = transport(addr, "/t/");
    let resp = t.get(&t.poll_url()).unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, "{}");
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[test]
fn second_transport_failure_is_surfaced() {
    let (addr, accepted) = flaky_server(usize::MAX);
    let t = transport(addr, "/t/");
    let err = t.get(&t.poll_url()).unwrap_err();
    assert!(matches!(err, TransportError::Unreachable { .. }), "{err:?}");
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}
