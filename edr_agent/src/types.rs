//! Wire types exchanged with the server: command/response envelopes and telemetry events.
//! Keep this module minimal and stable: it defines the wire format.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const KILL_PROCESS: &str = "kill_process";
pub const ISOLATE_HOST: &str = "isolate_host";
pub const DEISOLATE_HOST: &str = "deisolate_host";

/// Inbound command, delivered by poll or push (with `command_id`) or sent synchronously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    // kept raw: echo/event validate its shape themselves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

impl CommandEnvelope {
    pub fn is_response_action(&self) -> bool {
        matches!(
            self.kind.as_str(),
            KILL_PROCESS | ISOLATE_HOST | DEISOLATE_HOST
        )
    }

    pub fn message_str(&self) -> Option<&str> {
        self.message.as_ref().and_then(Value::as_str)
    }
}

/// Reply to a query command (`ping`, `auth`, `system_info`, errors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

impl QueryResponse {
    pub fn status(kind: &str, status: &str) -> Self {
        Self {
            kind: kind.to_string(),
            status: Some(status.to_string()),
            info: None,
        }
    }

    pub fn info(kind: &str, info: Value) -> Self {
        Self {
            kind: kind.to_string(),
            status: None,
            info: Some(info),
        }
    }

    pub fn error(status: &str) -> Self {
        Self::status("error", status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Success,
    Failed,
}

/// Result of a response action (kill/isolate/deisolate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub status: ActionStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
}

impl ActionOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Success,
            message: message.into(),
            error_code: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Failed,
            message: message.into(),
            error_code: None,
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// Any response the dispatcher can produce. Query replies always carry `type`,
/// action outcomes never do, which is what keeps the untagged form unambiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseEnvelope {
    Query(QueryResponse),
    Action(ActionOutcome),
}

impl ResponseEnvelope {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<QueryResponse> for ResponseEnvelope {
    fn from(q: QueryResponse) -> Self {
        ResponseEnvelope::Query(q)
    }
}

impl From<ActionOutcome> for ResponseEnvelope {
    fn from(a: ActionOutcome) -> Self {
        ResponseEnvelope::Action(a)
    }
}

// ---------- Telemetry ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    pub os_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub name: String,
    pub pid: u32,
    pub command_line: String,
    pub user: String,
    pub parent_image: String,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEvent {
    pub source_ip: String,
    pub source_port: u16,
    pub dest_ip: String,
    pub dest_port: u16,
    pub protocol: String,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEvent {
    pub path: String,
    pub operation: String,
    pub process_image: String,
}

/// One converted event as the collector ingests it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub agent_id: String,
    pub event_id: String,
    pub event_type: String,
    pub timestamp: i64,
    pub severity: String,
    pub version: String,
    pub host: HostInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileEvent>,
}
