//! Agent configuration: config.json loading, defaults, env overrides and auth token lookup.
//! Search order for the file: explicit path, ./config.json, $XDG_CONFIG_HOME/edr_agent/config.json.

use serde::{Deserialize, Serialize};
use std::{
    fs,
    net::{IpAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};
use url::{Host, Url};
use tracing::{info, warn};

use crate::error::ConfigError;

pub const TOKEN_ENV: &str = "EDR_AUTH_TOKEN";
pub const TOKEN_PLACEHOLDER: &str = "PLACEHOLDER_USE_ENV_VAR_EDR_AUTH_TOKEN";
pub const SECRET_FILE: &str = "auth.secret";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0 = retry forever
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5_000,
            max_delay_ms: 60_000,
            max_retries: 0,
        }
    }
}

impl ReconnectPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlChannel {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventSourceKind {
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub http_server: Option<String>,
    pub http_port: Option<u16>,
    pub api_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Push-channel URI (ws:// or wss://)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    pub disable_http_polling: bool,
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_channel: Option<ControlChannel>,
    pub admin_ports: Vec<u16>,
    pub rollback_on_partial_isolation: bool,
    pub reconnect: ReconnectPolicy,
    /// 0 disables push-channel heartbeats
    pub heartbeat_secs: u64,
    pub event_sources: Vec<EventSourceKind>,
    pub process_scan_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            http_server: None,
            http_port: None,
            api_path: "/api/v1/telemetry/".into(),
            auth_token: None,
            uri: None,
            disable_http_polling: false,
            poll_interval_secs: 5,
            batch_size: 100,
            control_channel: None,
            admin_ports: vec![80, 443],
            rollback_on_partial_isolation: false,
            reconnect: ReconnectPolicy::default(),
            heartbeat_secs: 0,
            event_sources: vec![EventSourceKind::Process],
            process_scan_interval_ms: 1_000,
        }
    }
}

impl AgentConfig {
    pub fn from_json(s: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_json::from_str(s).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn has_http_config(&self) -> bool {
        self.http_server.is_some() || self.http_port.is_some()
    }

    pub fn has_push_config(&self) -> bool {
        self.uri.as_deref().is_some_and(|u| !u.trim().is_empty())
    }

    pub fn server_host(&self) -> &str {
        self.http_server.as_deref().unwrap_or("localhost")
    }

    pub fn server_port(&self) -> u16 {
        self.http_port.unwrap_or(8000)
    }

    /// `http://host:port` (or `https://` when configured so) with no trailing slash.
    pub fn base_url(&self) -> String {
        let scheme = if self.server_host().trim().starts_with("https://") {
            "https"
        } else {
            "http"
        };
        let host = self.server_hostname();
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        format!("{scheme}://{host}:{}", self.server_port())
    }

    /// Bare server host: scheme, port and path stripped from `http_server`.
    pub fn server_hostname(&self) -> String {
        let raw = self.server_host().trim();
        let parsed = if raw.contains("://") {
            Url::parse(raw)
        } else {
            Url::parse(&format!("http://{raw}"))
        };
        match parsed.ok().as_ref().and_then(Url::host) {
            Some(Host::Domain(d)) => d.to_string(),
            Some(Host::Ipv4(a)) => a.to_string(),
            Some(Host::Ipv6(a)) => a.to_string(),
            None => raw.to_string(),
        }
    }

    /// Address/port the isolation allow-rule must keep reachable. Firewall rules take
    /// addresses, so a hostname is resolved here, IPv4 first.
    pub fn control_channel(&self) -> ControlChannel {
        if let Some(cc) = &self.control_channel {
            return cc.clone();
        }
        let host = self.server_hostname();
        let port = self.server_port();
        let address = if host.eq_ignore_ascii_case("localhost") {
            "127.0.0.1".to_string()
        } else if host.parse::<IpAddr>().is_ok() {
            host
        } else {
            resolve_address(&host, port).unwrap_or_else(|| {
                warn!(host = %host, "could not resolve control channel host; using the name");
                host
            })
        };
        ControlChannel { address, port }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs))
    }

    pub fn process_scan_interval(&self) -> Duration {
        Duration::from_millis(self.process_scan_interval_ms.max(100))
    }

    /// Apply `EDR_AGENT_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse::<u64>("EDR_AGENT_POLL_INTERVAL_SECS") {
            self.poll_interval_secs = v;
        }
        if let Some(v) = env_parse::<usize>("EDR_AGENT_BATCH_SIZE") {
            self.batch_size = v.max(1);
        }
    }

    /// Bootstrap checks that must hold before any subsystem starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.has_http_config() {
            return Err(ConfigError::MissingHttp);
        }
        if self.event_sources.is_empty() {
            return Err(ConfigError::NoEventSources);
        }
        Ok(())
    }
}

fn resolve_address(host: &str, port: u16) -> Option<String> {
    let addrs: Vec<_> = (host, port).to_socket_addrs().ok()?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or(addrs.first())
        .map(|a| a.ip().to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

pub fn config_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join("edr_agent")
    } else {
        dirs_next::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("edr_agent")
    }
}

/// First existing candidate, or ./config.json so the read error names something sensible.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return local;
    }
    let xdg = config_dir().join(CONFIG_FILE);
    if xdg.exists() {
        return xdg;
    }
    local
}

pub fn load_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    let s = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg = AgentConfig::from_json(&s, path)?;
    cfg.apply_env();
    info!(path = %path.display(), "loaded configuration");
    Ok(cfg)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Environment,
    SecretFile,
    ConfigFile,
}

/// Resolve the auth token: environment, then `auth.secret` next to the config, then the config
/// itself (placeholder rejected).
pub fn resolve_token(
    cfg: &AgentConfig,
    config_path: &Path,
    env_value: Option<String>,
) -> Option<(String, TokenSource)> {
    if let Some(t) = env_value.map(|t| t.trim().to_string()) {
        if !t.is_empty() {
            info!("using auth token from {TOKEN_ENV}");
            return Some((t, TokenSource::Environment));
        }
    }

    let secret = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(SECRET_FILE);
    if let Ok(s) = fs::read_to_string(&secret) {
        let first = s.lines().next().unwrap_or("").trim();
        if !first.is_empty() {
            info!(path = %secret.display(), "using auth token from secret file");
            return Some((first.to_string(), TokenSource::SecretFile));
        }
    }

    match cfg.auth_token.as_deref().map(str::trim) {
        Some(TOKEN_PLACEHOLDER) => {
            warn!("config contains the placeholder token; set {TOKEN_ENV}");
            None
        }
        Some(t) if !t.is_empty() => {
            warn!("using auth token stored in config.json; prefer {TOKEN_ENV} or {SECRET_FILE}");
            Some((t.to_string(), TokenSource::ConfigFile))
        }
        _ => None,
    }
}
