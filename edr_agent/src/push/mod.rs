//! Persistent WebSocket push channel with automatic reconnect.
//!
//! A dedicated thread owns a current-thread tokio runtime running one task:
//! resolve, connect, handshake, then read until the socket fails, then back off and retry.
//! `send` hands frames to that task over a channel so it stays the only writer on the socket.

pub mod state;
pub mod uri;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::client_async_tls_with_config;
use tracing::{debug, error, info, warn};

use crate::config::ReconnectPolicy;
use crate::dispatch::{AuthPhase, Dispatcher, INVALID_AUTH};
use crate::error::TransportError;
use crate::http::USER_AGENT;
use crate::types::{CommandEnvelope, QueryResponse, ResponseEnvelope};
pub use state::{Backoff, LinkPhase, LinkState, Reconnect};
pub use uri::PushTarget;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type SharedState = Arc<Mutex<LinkState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, LinkState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

struct Worker {
    outbound: mpsc::UnboundedSender<String>,
    stop: watch::Sender<bool>,
    thread: JoinHandle<()>,
}

pub struct PushChannel {
    dispatcher: Dispatcher,
    policy: ReconnectPolicy,
    heartbeat: Option<Duration>,
    state: SharedState,
    worker: Mutex<Option<Worker>>,
}

impl PushChannel {
    pub fn new(dispatcher: Dispatcher, policy: ReconnectPolicy, heartbeat: Option<Duration>) -> Self {
        let state = Arc::new(Mutex::new(LinkState::new(&policy)));
        Self {
            dispatcher,
            policy,
            heartbeat,
            state,
            worker: Mutex::new(None),
        }
    }

    /// Start the background connection task. Returns once the task is running; the link
    /// itself comes up asynchronously (see `is_open`).
    pub fn connect(&self, uri: &str) -> Result<(), TransportError> {
        let target = PushTarget::parse(uri)?;
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(w) = worker.as_ref() {
            if !w.thread.is_finished() {
                debug!("push channel already running");
                return Ok(());
            }
        }
        if let Some(old) = worker.take() {
            let _ = old.thread.join();
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TransportError::Runtime(e.to_string()))?;
        *lock(&self.state) = LinkState::new(&self.policy);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = Task {
            target,
            state: Arc::clone(&self.state),
            dispatcher: self.dispatcher.clone(),
            heartbeat: self.heartbeat,
            outbound: out_rx,
            stop: stop_rx,
        };
        let thread = thread::Builder::new()
            .name("edr-push".into())
            .spawn(move || {
                runtime.block_on(task.run());
                // a response action may still be running on the blocking pool
                runtime.shutdown_background();
            })
            .map_err(|e| TransportError::Runtime(e.to_string()))?;
        *worker = Some(Worker {
            outbound: out_tx,
            stop: stop_tx,
            thread,
        });
        Ok(())
    }

    /// Queue a text frame for the socket writer.
    pub fn send(&self, frame: impl Into<String>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        worker
            .as_ref()
            .ok_or(TransportError::NotConnected)?
            .outbound
            .send(frame.into())
            .map_err(|_| TransportError::NotConnected)
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).is_open()
    }

    pub fn phase(&self) -> LinkPhase {
        lock(&self.state).phase()
    }

    /// Stop reconnecting, send a close frame if open, stop the task and join its thread.
    pub fn close(&self) {
        lock(&self.state).on_close();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(w) = worker {
            let _ = w.stop.send(true);
            drop(w.outbound);
            if w.thread.join().is_err() {
                error!("push channel thread panicked");
            }
            info!("push channel closed");
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.close();
    }
}

enum SessionEnd {
    Stopped,
    PeerClosed,
}

struct Task {
    target: PushTarget,
    state: SharedState,
    dispatcher: Dispatcher,
    heartbeat: Option<Duration>,
    outbound: mpsc::UnboundedReceiver<String>,
    stop: watch::Receiver<bool>,
}

impl Task {
    async fn run(mut self) {
        loop {
            match self.session().await {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::PeerClosed) => info!(uri = %self.target.url(), "push channel closed by peer"),
                Err(e) => warn!(uri = %self.target.url(), error = %e, "push channel failure"),
            }
            let next = lock(&self.state).on_failure();
            match next {
                Reconnect::After(delay) => {
                    let retry = lock(&self.state).backoff().retry_count();
                    info!(retry, ?delay, "scheduling push channel reconnect");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stopped(&mut self.stop) => break,
                    }
                }
                Reconnect::Disabled => break,
                Reconnect::Exhausted => {
                    error!("push channel reconnect attempts exhausted; giving up");
                    break;
                }
            }
        }
        lock(&self.state).on_close();
    }

    async fn session(&mut self) -> Result<SessionEnd, TransportError> {
        let target = self.target.clone();

        lock(&self.state).on_resolving();
        let resolved = tokio::select! {
            r = lookup_host((target.host.as_str(), target.port)) => r,
            _ = stopped(&mut self.stop) => return Ok(SessionEnd::Stopped),
        };
        let addrs: Vec<_> = resolved
            .map_err(|e| TransportError::Resolve {
                host: target.host.clone(),
                reason: e.to_string(),
            })?
            .collect();

        lock(&self.state).on_connecting();
        let connect = async {
            let mut last = None;
            for addr in &addrs {
                match TcpStream::connect(addr).await {
                    Ok(s) => return Ok(s),
                    Err(e) => last = Some(e.to_string()),
                }
            }
            Err(last.unwrap_or_else(|| "no addresses".into()))
        };
        let tcp = tokio::select! {
            r = timeout(CONNECT_TIMEOUT, connect) => r,
            _ = stopped(&mut self.stop) => return Ok(SessionEnd::Stopped),
        };
        let tcp = match tcp {
            Ok(Ok(s)) => s,
            Ok(Err(reason)) => {
                return Err(TransportError::Connect {
                    target: target.authority(),
                    reason,
                })
            }
            Err(_) => {
                return Err(TransportError::Connect {
                    target: target.authority(),
                    reason: format!("timed out after {CONNECT_TIMEOUT:?}"),
                })
            }
        };
        let _ = tcp.set_nodelay(true);

        lock(&self.state).on_handshaking();
        let mut request = target.url().into_client_request()?;
        request
            .headers_mut()
            .insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        let handshake = tokio::select! {
            r = client_async_tls_with_config(request, tcp, None, None) => r,
            _ = stopped(&mut self.stop) => return Ok(SessionEnd::Stopped),
        };
        let (ws, _resp) = handshake?;

        lock(&self.state).on_open();
        info!(uri = %target.url(), "push channel connected");

        let (mut sink, mut stream) = ws.split();
        let mut auth = AuthPhase::default();
        let (reply_tx, mut replies) = mpsc::unbounded_channel::<String>();
        let mut inflight = JoinSet::new();
        let mut heartbeat = self.heartbeat.map(|d| {
            let mut i = interval_at(Instant::now() + d, d);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i
        });

        loop {
            tokio::select! {
                _ = stopped(&mut self.stop) => {
                    let _ = timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await;
                    return Ok(SessionEnd::Stopped);
                }
                out = self.outbound.recv() => match out {
                    Some(frame) => sink.send(Message::Text(frame)).await?,
                    None => {
                        let _ = timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await;
                        return Ok(SessionEnd::Stopped);
                    }
                },
                _ = tick(&mut heartbeat) => {
                    let beat = json!({"type": "heartbeat", "timestamp": chrono::Utc::now().timestamp()});
                    sink.send(Message::Text(beat.to_string())).await?;
                }
                Some(reply) = replies.recv() => sink.send(Message::Text(reply)).await?,
                Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = done {
                        error!(error = %e, "command handler panicked");
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = self.handle_frame(&text, &mut auth, &mut inflight, &reply_tx).await;
                        if let Some(reply) = reply {
                            sink.send(Message::Text(reply)).await?;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "close frame received");
                        return Ok(SessionEnd::PeerClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(SessionEnd::PeerClosed),
                },
            }
        }
    }

    /// Route one inbound text frame; returns the reply to send now, if any. Commands run as
    /// separate tasks and answer through `replies`, so the socket keeps serving meanwhile.
    async fn handle_frame(
        &self,
        text: &str,
        auth: &mut AuthPhase,
        inflight: &mut JoinSet<()>,
        replies: &mpsc::UnboundedSender<String>,
    ) -> Option<String> {
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            debug!(len = text.len(), "ignoring non-JSON frame");
            return None;
        };
        let kind = frame.get("type").and_then(Value::as_str).map(str::to_owned);
        match kind.as_deref() {
            Some("command") => {
                let cmd = normalize_command(&frame)?;
                let dispatcher = self.dispatcher.clone();
                let replies = replies.clone();
                inflight.spawn(async move {
                    let id = cmd.command_id.clone();
                    if let Some(resp) = dispatch_blocking(dispatcher, cmd).await {
                        let _ = replies.send(wrap_response(id.as_deref(), &resp));
                    }
                });
                None
            }
            Some("auth") => {
                let cmd: CommandEnvelope = serde_json::from_value(frame).ok()?;
                let message = cmd.message_str().unwrap_or_default().to_string();
                let Some(next) = auth.advance(&message) else {
                    warn!(phase = ?*auth, msg = %message, "unexpected auth message");
                    return Some(ResponseEnvelope::from(QueryResponse::error(INVALID_AUTH)).to_json());
                };
                debug!(from = ?*auth, to = ?next, "auth handshake");
                *auth = next;
                dispatch_blocking(self.dispatcher.clone(), cmd)
                    .await
                    .map(|r| r.to_json())
            }
            Some(kind @ ("connection_established" | "heartbeat_ack")) => {
                debug!(kind, "server notice");
                None
            }
            other => {
                debug!(kind = ?other, "ignoring frame");
                None
            }
        }
    }
}

// response actions block for seconds; keep them off the socket task
async fn dispatch_blocking(dispatcher: Dispatcher, cmd: CommandEnvelope) -> Option<ResponseEnvelope> {
    match tokio::task::spawn_blocking(move || dispatcher.dispatch(&cmd)).await {
        Ok(resp) => resp,
        Err(e) => {
            error!(error = %e, "command handler panicked");
            None
        }
    }
}

/// Resolves once stop was requested or the handle is gone.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// `{"type":"command","action":X,...}` becomes `{"type":X,...}`; other command frames parse as is.
pub fn normalize_command(frame: &Value) -> Option<CommandEnvelope> {
    let Some(action) = frame.get("action").and_then(Value::as_str) else {
        return serde_json::from_value(frame.clone()).ok();
    };
    let parameters = frame
        .get("parameters")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let command_id = match frame.get("command_id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    Some(CommandEnvelope {
        kind: action.to_string(),
        parameters,
        command_id,
        message: frame.get("message").cloned(),
    })
}

/// Tag a response with the command it answers: `{"type":"response","command_id":..,..fields}`.
pub fn wrap_response(command_id: Option<&str>, resp: &ResponseEnvelope) -> String {
    let Some(id) = command_id else {
        return resp.to_json();
    };
    let mut out = Map::new();
    out.insert("type".into(), json!("response"));
    out.insert("command_id".into(), json!(id));
    if let Ok(Value::Object(fields)) = serde_json::to_value(resp) {
        for (k, v) in fields {
            if k != "type" {
                out.insert(k, v);
            }
        }
    }
    Value::Object(out).to_string()
}
