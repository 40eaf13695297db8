//! Response actions: privileged, irreversible operations triggered by remote commands.

pub mod firewall;
pub mod process;

use std::time::Duration;
use tracing::{error, info};

use crate::config::{AgentConfig, ControlChannel};
use crate::types::ActionOutcome;
use firewall::{isolation_rules, Firewall, IsolationRule};
use process::{kill_process_tree, KillError, EXIT_WAIT};

/// The three response actions the dispatcher can route to.
pub trait ResponseActions: Send + Sync {
    fn kill_process_tree(&self, pid: u32) -> ActionOutcome;
    fn isolate_host(&self) -> ActionOutcome;
    fn deisolate_host(&self) -> ActionOutcome;
}

pub struct LocalExecutor {
    firewall: Firewall,
    rules: Vec<IsolationRule>,
    rollback_on_partial_isolation: bool,
    exit_wait: Duration,
}

impl LocalExecutor {
    pub fn new(firewall: Firewall, control: &ControlChannel, admin_ports: &[u16]) -> Self {
        Self {
            firewall,
            rules: isolation_rules(control, admin_ports),
            rollback_on_partial_isolation: false,
            exit_wait: EXIT_WAIT,
        }
    }

    pub fn from_config(cfg: &AgentConfig) -> Self {
        let mut exec = Self::new(Firewall::native(), &cfg.control_channel(), &cfg.admin_ports);
        exec.rollback_on_partial_isolation = cfg.rollback_on_partial_isolation;
        exec
    }

    pub fn with_rollback(mut self, on: bool) -> Self {
        self.rollback_on_partial_isolation = on;
        self
    }

    pub fn rules(&self) -> &[IsolationRule] {
        &self.rules
    }
}

pub fn kill_failure(err: &KillError) -> ActionOutcome {
    match err.code() {
        Some(code) => ActionOutcome::failed(format!(
            "Failed to terminate process. Error Code: {code} ({err})"
        ))
        .with_code(i64::from(code)),
        None => ActionOutcome::failed(format!("Failed to terminate process: {err}")),
    }
}

impl ResponseActions for LocalExecutor {
    fn kill_process_tree(&self, pid: u32) -> ActionOutcome {
        match kill_process_tree(pid, self.exit_wait) {
            Ok(_) => ActionOutcome::success("Process tree terminated"),
            Err(e) => {
                error!(pid, error = %e, "kill_process failed");
                kill_failure(&e)
            }
        }
    }

    fn isolate_host(&self) -> ActionOutcome {
        match self
            .firewall
            .isolate(&self.rules, self.rollback_on_partial_isolation)
        {
            Ok(()) => {
                info!("host isolated");
                ActionOutcome::success("Host isolated")
            }
            Err(e) => {
                error!(error = %e, rolled_back = ?e.rolled_back, "isolate_host failed");
                ActionOutcome::failed(format!(
                    "Failed to isolate host ({e}). Check Admin privileges."
                ))
            }
        }
    }

    fn deisolate_host(&self) -> ActionOutcome {
        let report = self.firewall.deisolate(&self.rules);
        if report.success() {
            info!("host de-isolated");
            ActionOutcome::success("Host de-isolated")
        } else {
            let failed: Vec<_> = report.failed.iter().map(|(name, _)| *name).collect();
            error!(?failed, removed = ?report.removed, "deisolate_host incomplete");
            ActionOutcome::failed(format!(
                "Failed to de-isolate host (could not remove {}). Check Admin privileges.",
                failed.join(", ")
            ))
        }
    }
}
