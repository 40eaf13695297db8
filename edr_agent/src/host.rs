//! Host identity and system snapshot using sysinfo, for `auth` and `system_info` replies.

use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, Networks, RefreshKind, System, Users};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostInfoError {
    #[error("could not determine {0}")]
    Collector(&'static str),
}

/// Fingerprint sent in reply to "Authentication required".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub hostname: String,
    pub os: String,
    pub version: String,
    pub version_number: String,
    pub mac_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub hostname: String,
    pub os: String,
    pub version: String,
    pub version_number: String,
    pub timestamp: String,
    pub cpu_cores: usize,
    /// GiB
    pub total_memory: f64,
    /// GiB
    pub available_memory: f64,
    pub architecture: String,
    pub mac_address: String,
    pub username: String,
}

pub trait SystemInfoSource: Send + Sync {
    fn identity(&self) -> Result<HostIdentity, HostInfoError>;
    fn snapshot(&self) -> Result<SystemSnapshot, HostInfoError>;
}

pub struct SysinfoHost;

/// Hostname for event envelopes and the agent id; "unknown" when the OS will not say.
pub fn hostname() -> String {
    lookup_hostname().unwrap_or_else(|_| "unknown".into())
}

pub fn lookup_hostname() -> Result<String, HostInfoError> {
    pick_hostname(
        hostname::get().ok().and_then(|s| s.into_string().ok()),
        System::host_name,
    )
}

fn pick_hostname(
    primary: Option<String>,
    fallback: impl FnOnce() -> Option<String>,
) -> Result<String, HostInfoError> {
    primary
        .filter(|h| !h.trim().is_empty())
        .or_else(|| fallback().filter(|h| !h.trim().is_empty()))
        .ok_or(HostInfoError::Collector("hostname"))
}

/// Total and available memory in GiB. A zero total means the collector read nothing.
fn memory_gib(total: u64, available: u64) -> Result<(f64, f64), HostInfoError> {
    if total == 0 {
        return Err(HostInfoError::Collector("memory statistics"));
    }
    Ok((gib(total), gib(available)))
}

pub fn os_name() -> String {
    System::name().unwrap_or_else(|| std::env::consts::OS.to_string())
}

pub fn os_version() -> String {
    System::os_version().unwrap_or_else(|| "Unknown".into())
}

fn version_number() -> String {
    System::kernel_version().unwrap_or_else(|| "Unknown".into())
}

/// First non-zero MAC, by interface name so the pick is stable across calls.
pub fn primary_mac() -> String {
    let nets = Networks::new_with_refreshed_list();
    let mut candidates: Vec<(String, String)> = nets
        .iter()
        .map(|(name, data)| (name.clone(), data.mac_address()))
        .filter(|(_, mac)| !mac.is_unspecified())
        .map(|(name, mac)| (name, mac.to_string().to_uppercase()))
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .map(|(_, mac)| mac)
        .unwrap_or_else(|| "Unknown".into())
}

fn current_username(sys: &System) -> String {
    let from_sysinfo = sysinfo::get_current_pid().ok().and_then(|pid| {
        let uid = sys.process(pid)?.user_id()?.clone();
        let users = Users::new_with_refreshed_list();
        users.get_user_by_id(&uid).map(|u| u.name().to_string())
    });
    from_sysinfo
        .or_else(|| std::env::var("USER").ok())
        .or_else(|| std::env::var("USERNAME").ok())
        .unwrap_or_else(|| "unknown".into())
}

fn gib(bytes: u64) -> f64 {
    let g = bytes as f64 / (1024.0 * 1024.0 * 1024.0);
    (g * 100.0).round() / 100.0
}

impl SystemInfoSource for SysinfoHost {
    fn identity(&self) -> Result<HostIdentity, HostInfoError> {
        Ok(HostIdentity {
            hostname: lookup_hostname()?,
            os: os_name(),
            version: os_version(),
            version_number: version_number(),
            mac_address: primary_mac(),
        })
    }

    fn snapshot(&self) -> Result<SystemSnapshot, HostInfoError> {
        let hostname = lookup_hostname()?;
        let refresh = RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::nothing())
            .with_memory(MemoryRefreshKind::everything());
        let mut sys = System::new_with_specifics(refresh);
        let (total_memory, available_memory) =
            memory_gib(sys.total_memory(), sys.available_memory())?;
        if let Ok(pid) = sysinfo::get_current_pid() {
            sys.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::Some(&[pid]),
                false,
                sysinfo::ProcessRefreshKind::nothing().with_user(sysinfo::UpdateKind::OnlyIfNotSet),
            );
        }
        Ok(SystemSnapshot {
            hostname,
            os: os_name(),
            version: os_version(),
            version_number: version_number(),
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            cpu_cores: sys.cpus().len().max(1),
            total_memory,
            available_memory,
            architecture: std::env::consts::ARCH.to_string(),
            mac_address: primary_mac(),
            username: current_username(&sys),
        })
    }
}
