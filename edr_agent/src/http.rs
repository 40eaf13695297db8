//! Blocking HTTP transport over a reusable `ureq::Agent`.
//!
//! The agent (connection pool) is created lazily and shared; a transport-level failure drops it,
//! builds a fresh one and retries the same request exactly once. HTTP status errors are final.

use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::error::TransportError;
use crate::telemetry::BatchSink;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const USER_AGENT: &str = "EDR-Agent/1.0";
pub const POLL_PATH: &str = "/api/v1/commands/poll/";
const MAX_BODY: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    fn accepted(&self) -> bool {
        matches!(self.status, 200 | 201)
    }
}

#[derive(Clone, Copy)]
enum Body<'a> {
    Empty,
    Json(&'a str),
    Gzip(&'a [u8]),
}

pub struct HttpTransport {
    base_url: String,
    api_path: String,
    headers: Vec<(String, String)>,
    agent: Mutex<Option<ureq::Agent>>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, api_path: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_path: api_path.into(),
            headers: Vec::new(),
            agent: Mutex::new(None),
        }
    }

    /// Transport for the configured server, authenticated as `agent_id`.
    pub fn from_config(cfg: &AgentConfig, token: &str, agent_id: &str) -> Self {
        Self::new(cfg.base_url(), cfg.api_path.clone())
            .with_header("Authorization", format!("Token {token}"))
            .with_header("X-Agent-ID", agent_id)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn poll_url(&self) -> String {
        format!("{}{POLL_PATH}", self.base_url)
    }

    pub fn result_url(&self, command_id: &str) -> String {
        format!("{}/api/v1/commands/result/{command_id}/", self.base_url)
    }

    pub fn telemetry_url(&self) -> String {
        format!("{}{}", self.base_url, self.api_path)
    }

    fn agent(&self) -> ureq::Agent {
        let mut guard = self.agent.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .get_or_insert_with(|| {
                debug!(base = %self.base_url, "creating HTTP connection pool");
                ureq::AgentBuilder::new()
                    .timeout_connect(CONNECT_TIMEOUT)
                    .user_agent(USER_AGENT)
                    .build()
            })
            .clone()
    }

    fn reset(&self) {
        let mut guard = self.agent.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    fn request(&self, agent: &ureq::Agent, method: &str, url: &str) -> ureq::Request {
        self.headers
            .iter()
            .fold(agent.request(method, url), |req, (k, v)| req.set(k, v))
    }

    /// Issue a request, rebuilding the pool and retrying once if no response came back.
    fn send_with_retry(
        &self,
        method: &str,
        url: &str,
        body: Body<'_>,
    ) -> Result<HttpResponse, TransportError> {
        let mut retried = false;
        loop {
            let req = self.request(&self.agent(), method, url);
            let sent = match body {
                Body::Empty => req.call(),
                Body::Json(s) => req.set("Content-Type", "application/json").send_string(s),
                Body::Gzip(b) => req
                    .set("Content-Type", "application/json")
                    .set("Content-Encoding", "gzip")
                    .send_bytes(b),
            };
            match sent {
                Ok(resp) => return read_response(resp),
                Err(ureq::Error::Status(code, resp)) => {
                    // drain so the connection can go back to the pool
                    let _ = read_response(resp);
                    return Err(TransportError::Status {
                        url: url.to_string(),
                        code,
                    });
                }
                Err(ureq::Error::Transport(t)) if !retried => {
                    warn!(url, error = %t, "HTTP send failed; reconnecting and retrying once");
                    self.reset();
                    retried = true;
                }
                Err(ureq::Error::Transport(t)) => {
                    self.reset();
                    return Err(TransportError::Unreachable {
                        url: url.to_string(),
                        reason: t.to_string(),
                    });
                }
            }
        }
    }

    pub fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        self.send_with_retry("GET", url, Body::Empty)
    }

    pub fn post(&self, url: &str, json: &str) -> Result<HttpResponse, TransportError> {
        self.send_with_retry("POST", url, Body::Json(json))
    }

    /// POST a gzip-compressed JSON array to the telemetry endpoint. Success is 200/201 only.
    pub fn send_compressed_batch(&self, gz: &[u8]) -> Result<(), TransportError> {
        let url = self.telemetry_url();
        let resp = self.send_with_retry("POST", &url, Body::Gzip(gz))?;
        expect_accepted(&url, resp)
    }

    /// POST one uncompressed JSON document to the telemetry endpoint.
    pub fn send_event(&self, json: &str) -> Result<(), TransportError> {
        let url = self.telemetry_url();
        let resp = self.post(&url, json)?;
        expect_accepted(&url, resp)
    }

    /// Next queued command, or None when the queue is empty (204, empty body or `{}`).
    pub fn poll_command(&self) -> Result<Option<String>, TransportError> {
        let resp = self.get(&self.poll_url())?;
        let body = resp.body.trim();
        if resp.status == 204 || body.is_empty() || body == "{}" {
            return Ok(None);
        }
        Ok(Some(body.to_string()))
    }

    pub fn post_result(&self, command_id: &str, response: &str) -> Result<(), TransportError> {
        let url = self.result_url(command_id);
        self.post(&url, response).map(|_| ())
    }
}

fn expect_accepted(url: &str, resp: HttpResponse) -> Result<(), TransportError> {
    if resp.accepted() {
        Ok(())
    } else {
        Err(TransportError::Status {
            url: url.to_string(),
            code: resp.status,
        })
    }
}

fn read_response(resp: ureq::Response) -> Result<HttpResponse, TransportError> {
    let status = resp.status();
    let mut body = String::new();
    resp.into_reader().take(MAX_BODY).read_to_string(&mut body)?;
    Ok(HttpResponse { status, body })
}

impl BatchSink for HttpTransport {
    fn send_compressed(&self, gz: &[u8]) -> Result<(), TransportError> {
        self.send_compressed_batch(gz)
    }

    fn send_plain(&self, json: &str) -> Result<(), TransportError> {
        self.send_event(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_urls() {
        let t = HttpTransport::new("http://10.0.0.5:8000/", "/api/v1/telemetry/");
        assert_eq!(t.poll_url(), "http://10.0.0.5:8000/api/v1/commands/poll/");
        assert_eq!(
            t.result_url("abc-1"),
            "http://10.0.0.5:8000/api/v1/commands/result/abc-1/"
        );
        assert_eq!(t.telemetry_url(), "http://10.0.0.5:8000/api/v1/telemetry/");
    }

    #[test]
    fn unreachable_after_single_retry() {
        // nothing listens on port 9 of the loopback in CI containers
        let t = HttpTransport::new("http://127.0.0.1:9", "/t/");
        match t.get(&t.poll_url()) {
            Err(TransportError::Unreachable { url, .. }) => assert!(url.ends_with(POLL_PATH)),
            other => panic!("expected Unreachable, got {other:?}"),
        }
    }
}
