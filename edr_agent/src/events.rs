//! Process-creation event source: diff successive sysinfo snapshots and convert new PIDs
//! into telemetry events.

use std::collections::{HashMap, HashSet};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind, Users};
use uuid::Uuid;

use crate::host;
use crate::types::{HostInfo, ProcessEvent, TelemetryEvent};

pub const EVENT_VERSION: &str = "1.0";

/// Wraps an event payload in the collector envelope.
pub struct EventFactory {
    agent_id: String,
    host: HostInfo,
}

impl EventFactory {
    pub fn new(agent_id: impl Into<String>, host: HostInfo) -> Self {
        Self {
            agent_id: agent_id.into(),
            host,
        }
    }

    pub fn local(agent_id: impl Into<String>) -> Self {
        Self::new(
            agent_id,
            HostInfo {
                hostname: host::hostname(),
                os: host::os_name(),
                os_version: host::os_version(),
            },
        )
    }

    pub fn process(&self, p: ProcessEvent) -> TelemetryEvent {
        TelemetryEvent {
            agent_id: self.agent_id.clone(),
            event_id: Uuid::new_v4().to_string(),
            event_type: "process".into(),
            timestamp: chrono::Utc::now().timestamp(),
            severity: "info".into(),
            version: EVENT_VERSION.into(),
            host: self.host.clone(),
            process: Some(p),
            network: None,
            file: None,
        }
    }
}

pub struct ProcessWatcher {
    sys: System,
    users: Users,
    known: Option<HashSet<u32>>,
    factory: EventFactory,
}

impl ProcessWatcher {
    pub fn new(factory: EventFactory) -> Self {
        Self {
            sys: System::new(),
            users: Users::new_with_refreshed_list(),
            known: None,
            factory,
        }
    }

    /// Events for processes started since the previous scan. The first scan only records a baseline.
    pub fn scan(&mut self) -> Vec<TelemetryEvent> {
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .without_tasks()
                .with_cmd(UpdateKind::OnlyIfNotSet)
                .with_user(UpdateKind::OnlyIfNotSet),
        );
        let current: HashSet<u32> = self
            .sys
            .processes()
            .values()
            .filter(|p| p.thread_kind().is_none())
            .map(|p| p.pid().as_u32())
            .collect();

        let Some(known) = self.known.replace(current.clone()) else {
            return Vec::new();
        };
        let mut fresh: Vec<u32> = current.difference(&known).copied().collect();
        fresh.sort_unstable();
        if fresh.iter().any(|pid| self.user_of(*pid).is_none()) {
            self.users.refresh();
        }

        let names: HashMap<Pid, String> = self
            .sys
            .processes()
            .iter()
            .map(|(pid, p)| (*pid, p.name().to_string_lossy().into_owned()))
            .collect();
        fresh
            .into_iter()
            .filter_map(|pid| {
                let p = self.sys.process(Pid::from_u32(pid))?;
                let command_line = p
                    .cmd()
                    .iter()
                    .map(|a| a.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ");
                let parent_image = p
                    .parent()
                    .and_then(|pp| names.get(&pp).cloned())
                    .unwrap_or_default();
                Some(self.factory.process(ProcessEvent {
                    name: p.name().to_string_lossy().into_owned(),
                    pid,
                    command_line,
                    user: self.user_of(pid).unwrap_or_default(),
                    parent_image,
                    action: "created".into(),
                }))
            })
            .collect()
    }

    fn user_of(&self, pid: u32) -> Option<String> {
        let uid = self.sys.process(Pid::from_u32(pid))?.user_id()?;
        self.users.get_user_by_id(uid).map(|u| u.name().to_string())
    }
}
