//! Command dispatch: parse an inbound envelope, answer queries, route response actions.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::executor::ResponseActions;
use crate::host::SystemInfoSource;
use crate::types::{
    ActionOutcome, CommandEnvelope, QueryResponse, ResponseEnvelope, DEISOLATE_HOST,
    ISOLATE_HOST, KILL_PROCESS,
};

pub const INVALID_ENVELOPE: &str = "invalid JSON or missing 'type' field";
pub const AUTH_REQUIRED: &str = "Authentication required";
pub const AUTH_SUCCESSFUL: &str = "Authentication successful";
/// Reply status for an auth message that does not fit the current handshake phase.
pub const INVALID_AUTH: &str = "invalid authentication message";

/// Per-connection auth handshake progress. The push channel owns one per socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthPhase {
    #[default]
    Unauthenticated,
    InfoSent,
    Authenticated,
}

impl AuthPhase {
    /// Next phase for an `auth` message, or None when the message is not valid here.
    pub fn advance(self, message: &str) -> Option<AuthPhase> {
        match (self, message) {
            // the server may ask again after a reconnect or a rejected fingerprint
            (_, AUTH_REQUIRED) => Some(AuthPhase::InfoSent),
            (AuthPhase::InfoSent, AUTH_SUCCESSFUL) => Some(AuthPhase::Authenticated),
            _ => None,
        }
    }
}

pub struct Dispatcher {
    actions: Arc<dyn ResponseActions>,
    host: Arc<dyn SystemInfoSource>,
}

impl Clone for Dispatcher {
    fn clone(&self) -> Self {
        Self {
            actions: Arc::clone(&self.actions),
            host: Arc::clone(&self.host),
        }
    }
}

impl Dispatcher {
    pub fn new(actions: Arc<dyn ResponseActions>, host: Arc<dyn SystemInfoSource>) -> Self {
        Self { actions, host }
    }

    /// Serialized response, or an empty string when the command has nothing to say.
    pub fn execute(&self, raw: &str) -> String {
        self.handle(raw)
            .map(|r| r.to_json())
            .unwrap_or_default()
    }

    pub fn handle(&self, raw: &str) -> Option<ResponseEnvelope> {
        match parse_envelope(raw) {
            Some(cmd) => self.dispatch(&cmd),
            None => {
                warn!(len = raw.len(), "rejecting malformed command");
                Some(QueryResponse::error(INVALID_ENVELOPE).into())
            }
        }
    }

    pub fn dispatch(&self, cmd: &CommandEnvelope) -> Option<ResponseEnvelope> {
        debug!(kind = %cmd.kind, command_id = ?cmd.command_id, "dispatching command");
        if cmd.is_response_action() {
            return Some(self.run_action(cmd).into());
        }
        match cmd.kind.as_str() {
            "ping" => Some(QueryResponse::status("ping", "pong").into()),
            "auth" => self.auth(cmd),
            "system_info" => Some(self.system_info()),
            "echo" | "event" => match cmd.message_str() {
                Some(_) => None,
                None => Some(QueryResponse::error("missing or invalid 'message'").into()),
            },
            other => {
                warn!(kind = other, "unknown command");
                Some(QueryResponse::error("unknown command").into())
            }
        }
    }

    fn run_action(&self, cmd: &CommandEnvelope) -> ActionOutcome {
        info!(kind = %cmd.kind, command_id = ?cmd.command_id, "executing response action");
        match cmd.kind.as_str() {
            KILL_PROCESS => match pid_param(cmd) {
                Some(pid) => self.actions.kill_process_tree(pid),
                None => ActionOutcome::failed("Missing PID"),
            },
            ISOLATE_HOST => self.actions.isolate_host(),
            DEISOLATE_HOST => self.actions.deisolate_host(),
            other => ActionOutcome::failed(format!("unsupported action {other}")),
        }
    }

    fn auth(&self, cmd: &CommandEnvelope) -> Option<ResponseEnvelope> {
        match cmd.message_str() {
            Some(AUTH_REQUIRED) => Some(match self.host.identity() {
                Ok(id) => QueryResponse::info("auth", json!(id)).into(),
                Err(e) => {
                    warn!(error = %e, "host identity unavailable");
                    QueryResponse::error("failed to get host identity").into()
                }
            }),
            Some(AUTH_SUCCESSFUL) => None,
            _ => Some(QueryResponse::error("unexpected auth message").into()),
        }
    }

    fn system_info(&self) -> ResponseEnvelope {
        match self.host.snapshot() {
            Ok(snap) => QueryResponse::info("system_info", json!({ "system_info": snap })).into(),
            Err(e) => {
                warn!(error = %e, "system info unavailable");
                QueryResponse::error("failed to get system info").into()
            }
        }
    }
}

/// Envelope with a non-empty `type`, or None for anything else.
pub fn parse_envelope(raw: &str) -> Option<CommandEnvelope> {
    serde_json::from_str::<CommandEnvelope>(raw)
        .ok()
        .filter(|c| !c.kind.is_empty())
}

fn pid_param(cmd: &CommandEnvelope) -> Option<u32> {
    cmd.parameters
        .get("pid")
        .and_then(Value::as_u64)
        .and_then(|p| u32::try_from(p).ok())
}
