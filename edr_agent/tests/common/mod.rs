//! Shared fixtures: in-process axum server and fake collaborators.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use edr_agent::executor::ResponseActions;
use edr_agent::host::{HostIdentity, HostInfoError, SystemInfoSource, SystemSnapshot};
use edr_agent::types::ActionOutcome;

/// Serve `app` on an ephemeral loopback port from a background runtime.
pub fn spawn_server(app: axum::Router) -> SocketAddr {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind");
            tx.send(listener.local_addr().expect("addr")).expect("send addr");
            axum::serve(listener, app).await.expect("serve");
        });
    });
    rx.recv_timeout(Duration::from_secs(5)).expect("server addr")
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Kill(u32),
    Isolate,
    Deisolate,
}

#[derive(Default)]
pub struct FakeActions {
    pub calls: Mutex<Vec<Call>>,
    /// How long `isolate_host` takes.
    pub isolate_delay: Duration,
}

impl FakeActions {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl ResponseActions for FakeActions {
    fn kill_process_tree(&self, pid: u32) -> ActionOutcome {
        self.calls.lock().unwrap().push(Call::Kill(pid));
        ActionOutcome::success("Process tree terminated")
    }

    fn isolate_host(&self) -> ActionOutcome {
        self.calls.lock().unwrap().push(Call::Isolate);
        std::thread::sleep(self.isolate_delay);
        ActionOutcome::success("Host isolated")
    }

    fn deisolate_host(&self) -> ActionOutcome {
        self.calls.lock().unwrap().push(Call::Deisolate);
        ActionOutcome::failed("Failed to de-isolate host (could not remove EDR_ALLOW_DNS). Check Admin privileges.")
    }
}

pub struct FakeHost {
    pub broken: bool,
}

impl SystemInfoSource for FakeHost {
    fn identity(&self) -> Result<HostIdentity, HostInfoError> {
        if self.broken {
            return Err(HostInfoError::Collector("host identity"));
        }
        Ok(HostIdentity {
            hostname: "ws-042".into(),
            os: "Linux".into(),
            version: "22.04".into(),
            version_number: "6.8.0".into(),
            mac_address: "AA:BB:CC:DD:EE:FF".into(),
        })
    }

    fn snapshot(&self) -> Result<SystemSnapshot, HostInfoError> {
        if self.broken {
            return Err(HostInfoError::Collector("system snapshot"));
        }
        Ok(SystemSnapshot {
            hostname: "ws-042".into(),
            os: "Linux".into(),
            version: "22.04".into(),
            version_number: "6.8.0".into(),
            timestamp: "2026-01-01 12:00:00".into(),
            cpu_cores: 8,
            total_memory: 15.5,
            available_memory: 7.25,
            architecture: "x86_64".into(),
            mac_address: "AA:BB:CC:DD:EE:FF".into(),
            username: "analyst".into(),
        })
    }
}

pub fn dispatcher_with(actions: Arc<FakeActions>, broken_host: bool) -> edr_agent::Dispatcher {
    edr_agent::Dispatcher::new(actions, Arc::new(FakeHost { broken: broken_host }))
}
