// In-memory container runtime and daemon launcher for manager and API tests

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::daemon::provisioner::{DaemonHandle, DaemonLauncher, DaemonState, RuntimeDirs};
use crate::daemon::runtime::ContainerRuntime;
use crate::icc::network::port_mapping::PortMapping;
use crate::sync::error::{BridgerError, BridgerResult};

#[derive(Default)]
pub struct FakeRuntime {
    pids: Mutex<HashMap<String, u32>>,
    ports: Mutex<HashMap<String, Vec<PortMapping>>>,
    addresses: Mutex<HashMap<String, HashMap<String, Ipv4Addr>>>,
    containers: Mutex<HashMap<String, usize>>,
    unreachable: Mutex<HashSet<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Container is running with `pid`; 0 means created but not running
    pub fn set_pid(&self, container_id: &str, pid: u32) {
        self.pids.lock().insert(container_id.to_string(), pid);
    }

    pub fn remove_container(&self, container_id: &str) {
        self.pids.lock().remove(container_id);
    }

    pub fn publish(&self, host: &str, mappings: Vec<PortMapping>) {
        self.ports.lock().insert(host.to_string(), mappings);
    }

    pub fn set_container_count(&self, host: &str, count: usize) {
        self.containers.lock().insert(host.to_string(), count);
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut hosts = self.unreachable.lock();
        if unreachable {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn container_pid(&self, _host: &str, container_id: &str) -> Result<Option<u32>, String> {
        match self.pids.lock().get(container_id) {
            Some(0) => Ok(None),
            Some(pid) => Ok(Some(*pid)),
            None => Err(format!("No such container: {}", container_id)),
        }
    }

    async fn published_ports(&self, host: &str) -> BridgerResult<Vec<PortMapping>> {
        if self.unreachable.lock().contains(host) {
            return Err(BridgerError::runtime(format!("cannot connect to {}", host)));
        }
        Ok(self.ports.lock().get(host).cloned().unwrap_or_default())
    }

    async fn container_addresses(&self, host: &str) -> BridgerResult<HashMap<String, Ipv4Addr>> {
        Ok(self.addresses.lock().get(host).cloned().unwrap_or_default())
    }

    async fn container_count(&self, host: &str) -> BridgerResult<usize> {
        if self.unreachable.lock().contains(host) {
            return Err(BridgerError::runtime(format!("cannot connect to {}", host)));
        }
        Ok(self.containers.lock().get(host).copied().unwrap_or(0))
    }

    async fn ping(&self, host: &str) -> bool {
        !self.unreachable.lock().contains(host)
    }
}

/// Launches nothing; each handle runs until stopped or killed, or exits
/// at once when `crash_on_launch` is set.
#[derive(Default)]
pub struct FakeLauncher {
    launched: Mutex<Vec<(String, String)>>,
    states: Arc<Mutex<HashMap<String, Arc<watch::Sender<DaemonState>>>>>,
    adopted: Mutex<Vec<(String, Option<u32>)>>,
    crash_on_launch: AtomicBool,
    fail_launch: AtomicBool,
    next_pid: AtomicU32,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(40_000),
            ..Default::default()
        }
    }

    /// (scope, bridge) per launch
    pub fn launched(&self) -> Vec<(String, String)> {
        self.launched.lock().clone()
    }

    pub fn adopted(&self) -> Vec<(String, Option<u32>)> {
        self.adopted.lock().clone()
    }

    pub fn crash_on_launch(&self, crash: bool) {
        self.crash_on_launch.store(crash, Ordering::SeqCst);
    }

    pub fn fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    /// The scope's daemon dies as if SIGKILLed
    pub fn kill(&self, scope_id: &str) {
        if let Some(state_tx) = self.states.lock().get(scope_id) {
            let _ = state_tx.send(DaemonState::Error("signal: 9 (SIGKILL)".to_string()));
        }
    }

    fn idle_handle(&self, scope_id: &str, pid: Option<u32>) -> DaemonHandle {
        let states = self.states.clone();
        let scope = scope_id.to_string();
        DaemonHandle::monitored(pid, move |state_tx, stop_rx| {
            let state_tx = Arc::new(state_tx);
            states.lock().insert(scope, state_tx.clone());
            async move {
                let _ = stop_rx.await;
                let _ = state_tx.send(DaemonState::Stopped);
            }
        })
    }
}

#[async_trait]
impl DaemonLauncher for FakeLauncher {
    async fn launch(&self, scope_id: &str, _dirs: &RuntimeDirs, bridge: &str) -> BridgerResult<DaemonHandle> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(BridgerError::runtime("failed to start dockerd: No such file or directory"));
        }
        self.launched
            .lock()
            .push((scope_id.to_string(), bridge.to_string()));
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);

        if self.crash_on_launch.load(Ordering::SeqCst) {
            return Ok(DaemonHandle::monitored(Some(pid), |state_tx, stop_rx| async move {
                let _ = state_tx.send(DaemonState::Error("exit status: 1".to_string()));
                let _ = stop_rx.await;
            }));
        }
        Ok(self.idle_handle(scope_id, Some(pid)))
    }

    fn adopt(&self, scope_id: &str, pid: Option<u32>) -> DaemonHandle {
        self.adopted.lock().push((scope_id.to_string(), pid));
        self.idle_handle(scope_id, pid)
    }
}
