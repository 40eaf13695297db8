//! Host isolation through named outbound firewall rules.
//!
//! Isolation state lives only in the OS firewall: the presence of the four rules below is
//! the state. `netsh advfirewall` is used on Windows, the iptables OUTPUT chain elsewhere.

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::config::ControlChannel;

/// External firewall commands are killed after this long.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on duplicate copies of one iptables rule removed by a single deisolate.
const MAX_DUPLICATES: usize = 32;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with status {code:?}: {stderr}")]
    Exit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

/// Seam over process spawning so rule sequencing can be exercised without root.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<(), FirewallError>;
}

/// Runs firewall tools through tokio's process API, killing them on timeout.
/// Callers are blocking threads, so each call drives its own current-thread runtime.
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run_async(&self, program: &str, args: &[String]) -> Result<(), FirewallError> {
        let spawn_err = |source| FirewallError::Spawn {
            program: program.to_string(),
            source,
        };
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        tokio::select! {
            (status, out, err) = async {
                tokio::join!(child.wait(), drain(&mut stdout), drain(&mut stderr))
            } => {
                let status = status.map_err(spawn_err)?;
                if !out.is_empty() {
                    debug!(program, stdout = %String::from_utf8_lossy(&out).trim(), "firewall command output");
                }
                if status.success() {
                    Ok(())
                } else {
                    Err(FirewallError::Exit {
                        program: program.to_string(),
                        code: status.code(),
                        stderr: String::from_utf8_lossy(&err).trim().to_string(),
                    })
                }
            }
            () = tokio::time::sleep(self.timeout) => {
                let _ = child.kill().await;
                Err(FirewallError::Timeout {
                    program: program.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }
}

async fn drain<R: tokio::io::AsyncRead + Unpin>(handle: &mut Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.read_to_end(&mut buf).await;
    }
    buf
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(COMMAND_TIMEOUT)
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<(), FirewallError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| FirewallError::Spawn {
                program: program.to_string(),
                source,
            })?;
        runtime.block_on(self.run_async(program, args))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationRule {
    BlockAllOutbound,
    AllowAdminPorts(Vec<u16>),
    AllowControlChannel { address: String, port: u16 },
    AllowDns,
}

impl IsolationRule {
    pub fn name(&self) -> &'static str {
        match self {
            IsolationRule::BlockAllOutbound => "EDR_BLOCK_ALL",
            IsolationRule::AllowAdminPorts(_) => "EDR_ALLOW_ADMIN",
            IsolationRule::AllowControlChannel { .. } => "EDR_ALLOW_SERVER",
            IsolationRule::AllowDns => "EDR_ALLOW_DNS",
        }
    }
}

/// Rules in install order: deny first, then the narrower allows.
pub fn isolation_rules(control: &ControlChannel, admin_ports: &[u16]) -> Vec<IsolationRule> {
    vec![
        IsolationRule::BlockAllOutbound,
        IsolationRule::AllowAdminPorts(admin_ports.to_vec()),
        IsolationRule::AllowControlChannel {
            address: control.address.clone(),
            port: control.port,
        },
        IsolationRule::AllowDns,
    ]
}

fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Netsh,
    Iptables,
}

impl Backend {
    pub fn native() -> Self {
        if cfg!(windows) {
            Backend::Netsh
        } else {
            Backend::Iptables
        }
    }

    pub fn program(self) -> &'static str {
        match self {
            Backend::Netsh => "netsh.exe",
            Backend::Iptables => "iptables",
        }
    }

    pub fn add_args(self, rule: &IsolationRule) -> Vec<String> {
        match self {
            Backend::Netsh => {
                let mut args = netsh_prefix("add", rule);
                args.push("dir=out".into());
                match rule {
                    IsolationRule::BlockAllOutbound => args.push("action=block".into()),
                    IsolationRule::AllowAdminPorts(ports) => args.extend([
                        "action=allow".into(),
                        "protocol=TCP".into(),
                        format!("remoteport={}", join_ports(ports)),
                    ]),
                    IsolationRule::AllowControlChannel { address, port } => args.extend([
                        "action=allow".into(),
                        format!("remoteip={address}"),
                        "protocol=TCP".into(),
                        format!("remoteport={port}"),
                    ]),
                    IsolationRule::AllowDns => args.extend([
                        "action=allow".into(),
                        "protocol=UDP".into(),
                        "remoteport=53".into(),
                    ]),
                }
                args
            }
            Backend::Iptables => {
                // insert at the head: later (narrower) allows end up above the deny
                let mut args = vec!["-I".into(), "OUTPUT".into(), "1".into()];
                args.extend(iptables_rule_args(rule));
                args
            }
        }
    }

    /// `iptables -C` check for an existing copy of the rule. netsh has no equivalent, and
    /// deleting by name there already removes every copy.
    pub fn check_args(self, rule: &IsolationRule) -> Option<Vec<String>> {
        match self {
            Backend::Netsh => None,
            Backend::Iptables => {
                let mut args = vec!["-C".into(), "OUTPUT".into()];
                args.extend(iptables_rule_args(rule));
                Some(args)
            }
        }
    }

    pub fn delete_args(self, rule: &IsolationRule) -> Vec<String> {
        match self {
            Backend::Netsh => netsh_prefix("delete", rule),
            Backend::Iptables => {
                let mut args = vec!["-D".into(), "OUTPUT".into()];
                args.extend(iptables_rule_args(rule));
                args
            }
        }
    }
}

fn netsh_prefix(verb: &str, rule: &IsolationRule) -> Vec<String> {
    vec![
        "advfirewall".into(),
        "firewall".into(),
        verb.into(),
        "rule".into(),
        format!("name={}", rule.name()),
    ]
}

fn iptables_rule_args(rule: &IsolationRule) -> Vec<String> {
    let mut args: Vec<String> = match rule {
        IsolationRule::BlockAllOutbound => vec![],
        IsolationRule::AllowAdminPorts(ports) => vec![
            "-p".into(),
            "tcp".into(),
            "-m".into(),
            "multiport".into(),
            "--dports".into(),
            join_ports(ports),
        ],
        IsolationRule::AllowControlChannel { address, port } => vec![
            "-p".into(),
            "tcp".into(),
            "-d".into(),
            address.clone(),
            "--dport".into(),
            port.to_string(),
        ],
        IsolationRule::AllowDns => vec![
            "-p".into(),
            "udp".into(),
            "--dport".into(),
            "53".into(),
        ],
    };
    args.extend([
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        rule.name().into(),
        "-j".into(),
    ]);
    args.push(match rule {
        IsolationRule::BlockAllOutbound => "DROP".into(),
        _ => "ACCEPT".into(),
    });
    args
}

#[derive(Debug, Error)]
#[error("isolation step {rule} failed: {source}")]
pub struct IsolationError {
    pub rule: &'static str,
    #[source]
    pub source: FirewallError,
    /// Rules installed before the failing step that were removed again.
    pub rolled_back: Vec<&'static str>,
}

#[derive(Debug, Default)]
pub struct DeisolationReport {
    pub removed: Vec<&'static str>,
    pub failed: Vec<(&'static str, FirewallError)>,
}

impl DeisolationReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Firewall {
    backend: Backend,
    runner: Box<dyn CommandRunner>,
}

impl Firewall {
    pub fn new(backend: Backend, runner: Box<dyn CommandRunner>) -> Self {
        Self { backend, runner }
    }

    pub fn native() -> Self {
        Self::new(Backend::native(), Box::new(SystemRunner::default()))
    }

    /// Whether the backend reports the rule as installed. Always false for backends without a check command.
    pub fn is_installed(&self, rule: &IsolationRule) -> Result<bool, FirewallError> {
        let Some(args) = self.backend.check_args(rule) else {
            return Ok(false);
        };
        match self.runner.run(self.backend.program(), &args) {
            Ok(()) => Ok(true),
            Err(FirewallError::Exit { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Install `rule` unless an identical copy is already present.
    pub fn add(&self, rule: &IsolationRule) -> Result<(), FirewallError> {
        if self.is_installed(rule)? {
            debug!(rule = rule.name(), "firewall rule already present");
            return Ok(());
        }
        self.runner
            .run(self.backend.program(), &self.backend.add_args(rule))
    }

    /// Remove `rule`, including duplicates left by earlier runs.
    pub fn remove(&self, rule: &IsolationRule) -> Result<(), FirewallError> {
        self.runner
            .run(self.backend.program(), &self.backend.delete_args(rule))?;
        for _ in 0..MAX_DUPLICATES {
            if !self.is_installed(rule)? {
                return Ok(());
            }
            self.runner
                .run(self.backend.program(), &self.backend.delete_args(rule))?;
        }
        warn!(rule = rule.name(), "firewall rule still present after repeated removal");
        Ok(())
    }

    /// Install `rules` in order, stopping at the first failure. Already-installed rules stay
    /// in place unless `rollback` is set.
    pub fn isolate(&self, rules: &[IsolationRule], rollback: bool) -> Result<(), IsolationError> {
        for (i, rule) in rules.iter().enumerate() {
            if let Err(source) = self.add(rule) {
                warn!(rule = rule.name(), error = %source, "isolation step failed");
                let mut rolled_back = Vec::new();
                if rollback {
                    for applied in rules[..i].iter().rev() {
                        match self.remove(applied) {
                            Ok(()) => rolled_back.push(applied.name()),
                            Err(e) => warn!(rule = applied.name(), error = %e, "rollback failed"),
                        }
                    }
                }
                return Err(IsolationError {
                    rule: rule.name(),
                    source,
                    rolled_back,
                });
            }
            info!(rule = rule.name(), "firewall rule installed");
        }
        Ok(())
    }

    /// Remove every rule, whatever happens to the others.
    pub fn deisolate(&self, rules: &[IsolationRule]) -> DeisolationReport {
        let mut report = DeisolationReport::default();
        for rule in rules {
            match self.remove(rule) {
                Ok(()) => report.removed.push(rule.name()),
                Err(e) => {
                    warn!(rule = rule.name(), error = %e, "failed to remove firewall rule");
                    report.failed.push((rule.name(), e));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> Vec<IsolationRule> {
        isolation_rules(
            &ControlChannel {
                address: "10.1.2.3".into(),
                port: 8000,
            },
            &[80, 443],
        )
    }

    #[test]
    fn netsh_rule_arguments() {
        let r = rules();
        assert_eq!(
            Backend::Netsh.add_args(&r[0]).join(" "),
            "advfirewall firewall add rule name=EDR_BLOCK_ALL dir=out action=block"
        );
        assert_eq!(
            Backend::Netsh.add_args(&r[2]).join(" "),
            "advfirewall firewall add rule name=EDR_ALLOW_SERVER dir=out action=allow \
             remoteip=10.1.2.3 protocol=TCP remoteport=8000"
        );
        assert_eq!(
            Backend::Netsh.delete_args(&r[3]).join(" "),
            "advfirewall firewall delete rule name=EDR_ALLOW_DNS"
        );
    }

    #[test]
    fn iptables_delete_mirrors_insert() {
        for rule in rules() {
            let add = Backend::Iptables.add_args(&rule);
            let del = Backend::Iptables.delete_args(&rule);
            assert_eq!(&add[..3], ["-I", "OUTPUT", "1"]);
            assert_eq!(&del[..2], ["-D", "OUTPUT"]);
            assert_eq!(add[3..], del[2..]);
            assert!(add.contains(&rule.name().to_string()));
            let check = Backend::Iptables.check_args(&rule).unwrap();
            assert_eq!(&check[..2], ["-C", "OUTPUT"]);
            assert_eq!(check[2..], del[2..]);
        }
        assert!(Backend::Netsh.check_args(&rules()[0]).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_reports_stderr_and_timeouts() {
        let runner = SystemRunner::default();
        runner.run("true", &[]).unwrap();

        let err = runner
            .run("sh", &["-c".into(), "echo 'Bad rule' >&2; exit 2".into()])
            .unwrap_err();
        match err {
            FirewallError::Exit { code, stderr, .. } => {
                assert_eq!(code, Some(2));
                assert_eq!(stderr, "Bad rule");
            }
            other => panic!("unexpected {other:?}"),
        }

        let slow = SystemRunner::new(Duration::from_millis(100));
        let start = std::time::Instant::now();
        let err = slow.run("sleep", &["5".into()]).unwrap_err();
        assert!(matches!(err, FirewallError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(3));

        assert!(matches!(
            runner.run("/nonexistent/edr-firewall-tool", &[]),
            Err(FirewallError::Spawn { .. })
        ));
    }

    #[test]
    fn install_order_is_deny_first() {
        let names: Vec<_> = rules().iter().map(IsolationRule::name).collect();
        assert_eq!(
            names,
            ["EDR_BLOCK_ALL", "EDR_ALLOW_ADMIN", "EDR_ALLOW_SERVER", "EDR_ALLOW_DNS"]
        );
    }
}
