//! Error types shared by the transports and bootstrap.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The request never produced an HTTP response, even after one reconnect.
    #[error("request to {url} failed: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("server returned HTTP {code} for {url}")]
    Status { url: String, code: u16 },
    #[error("failed to read response body: {0}")]
    Body(#[from] std::io::Error),
    #[error("invalid push-channel URI '{0}'")]
    InvalidUri(String),
    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },
    #[error("connect to {target} failed: {reason}")]
    Connect { target: String, reason: String },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("push channel is not connected")]
    NotConnected,
    #[error("failed to start push-channel runtime: {0}")]
    Runtime(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("HTTP configuration not found (set http_server and/or http_port)")]
    MissingHttp,
    #[error("no event sources configured")]
    NoEventSources,
    #[error("no auth token found in EDR_AUTH_TOKEN, auth.secret or config")]
    MissingToken,
}
