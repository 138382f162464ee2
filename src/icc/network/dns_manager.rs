// DNS management module
// Lifecycle of the per-scope responder and the desktop's resolver entry

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::icc::dns::{ContainerDirectory, DnsServer};
use crate::icc::resolv::prepend_nameserver;

const STOP_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsState {
    Running,
    Disabled,
    Stopped,
    Failed(String),
}

impl DnsState {
    /// Status string reported through the API
    pub fn describe(&self) -> String {
        match self {
            DnsState::Running => "running".to_string(),
            DnsState::Disabled => "disabled".to_string(),
            DnsState::Stopped => "stopped".to_string(),
            DnsState::Failed(reason) => format!("failed: {}", reason),
        }
    }

    pub fn needs_restart(&self) -> bool {
        matches!(self, DnsState::Stopped | DnsState::Failed(_))
    }
}

/// Owner of one running responder. Dropping the handle stops the responder.
pub struct DnsHandle {
    state: Arc<Mutex<DnsState>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl DnsHandle {
    fn settled(state: DnsState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            shutdown: None,
            task: None,
        }
    }

    pub fn disabled() -> Self {
        Self::settled(DnsState::Disabled)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::settled(DnsState::Failed(reason.into()))
    }

    pub fn state(&self) -> DnsState {
        self.state.lock().clone()
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(STOP_WAIT, task).await.is_err() {
                tracing::warn!("DNS responder did not stop in time");
            }
        }
        let mut state = self.state.lock();
        if *state != DnsState::Disabled {
            *state = DnsState::Stopped;
        }
    }
}

pub struct DnsManager {
    enabled: bool,
    port: u16,
}

impl DnsManager {
    pub fn new(enabled: bool, port: u16) -> Self {
        Self { enabled, port }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Start a responder on `gateway:port`. Never fails: a bind error is
    /// recorded in the handle so it shows up in instance status.
    pub async fn start(
        &self,
        scope_id: &str,
        gateway: Ipv4Addr,
        directory: Arc<dyn ContainerDirectory>,
        upstreams: Vec<SocketAddr>,
    ) -> DnsHandle {
        if !self.enabled {
            return DnsHandle::disabled();
        }

        let addr = SocketAddr::new(IpAddr::V4(gateway), self.port);
        let server = match DnsServer::bind(addr, directory, upstreams).await {
            Ok(server) => server,
            Err(e) => {
                tracing::warn!(scope_id, addr = %addr, "DNS responder failed to bind: {}", e);
                return DnsHandle::failed(format!("bind {}: {}", addr, e));
            }
        };

        let state = Arc::new(Mutex::new(DnsState::Running));
        let (tx, rx) = oneshot::channel();
        let task_state = state.clone();
        let scope = scope_id.to_string();
        let task = tokio::spawn(async move {
            server.run(rx).await;
            let mut st = task_state.lock();
            if *st == DnsState::Running {
                *st = DnsState::Stopped;
            }
            tracing::debug!(scope_id = %scope, "DNS responder task finished");
        });

        tracing::info!(scope_id, addr = %addr, "DNS responder started");
        DnsHandle {
            state,
            shutdown: Some(tx),
            task: Some(task),
        }
    }

    /// resolv.conf of a running process, seen through its root
    pub fn desktop_resolv_conf(pid: u32) -> PathBuf {
        PathBuf::from(format!("/proc/{}/root/etc/resolv.conf", pid))
    }

    /// Make `gateway` the first nameserver in `path`. The file is rewritten
    /// in place since container runtimes bind-mount it.
    pub async fn prepend_resolver(path: &Path, gateway: Ipv4Addr) -> std::io::Result<bool> {
        let current = tokio::fs::read_to_string(path).await?;
        match prepend_nameserver(&current, IpAddr::V4(gateway)) {
            Some(updated) => {
                tokio::fs::write(path, updated).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
