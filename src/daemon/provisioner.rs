// Isolated per-scope container runtime: directories, config, process lifecycle

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::sync::error::{BridgerError, BridgerResult};
use crate::sync::ipam::{parse_ipv4_cidr, TenantAddressing};
use crate::utils::constants::{TENANT_NET_OCTETS, TENANT_PREFIX_LEN};
use crate::utils::process::ProcessUtils;

const ADOPTED_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonState {
    Running,
    Stopped,
    Error(String),
}

impl DaemonState {
    pub fn describe(&self) -> String {
        match self {
            DaemonState::Running => "running".to_string(),
            DaemonState::Stopped => "stopped".to_string(),
            DaemonState::Error(reason) => format!("error: {}", reason),
        }
    }

    fn from_exit(status: std::io::Result<ExitStatus>) -> Self {
        match status {
            Ok(s) if s.success() => DaemonState::Stopped,
            Ok(s) => DaemonState::Error(s.to_string()),
            Err(e) => DaemonState::Error(format!("wait failed: {}", e)),
        }
    }
}

/// A watched runtime daemon. The monitor task owns the process; this handle
/// observes its state and can ask it to stop.
pub struct DaemonHandle {
    pid: Option<u32>,
    state: watch::Receiver<DaemonState>,
    stop_tx: Option<oneshot::Sender<Duration>>,
    task: Option<JoinHandle<()>>,
}

impl DaemonHandle {
    /// Run `monitor` as the owner of a daemon. It publishes state changes and
    /// receives a grace period when a stop is requested.
    pub fn monitored<F, Fut>(pid: Option<u32>, monitor: F) -> Self
    where
        F: FnOnce(watch::Sender<DaemonState>, oneshot::Receiver<Duration>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (state_tx, state_rx) = watch::channel(DaemonState::Running);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(monitor(state_tx, stop_rx));
        Self {
            pid,
            state: state_rx,
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    pub fn from_child(mut child: Child, scope_id: &str) -> Self {
        let pid = child.id();
        let scope = scope_id.to_string();
        Self::monitored(pid, move |state_tx, stop_rx| async move {
            let requested = tokio::select! {
                status = child.wait() => Err(status),
                Ok(grace) = stop_rx => Ok(grace),
            };
            let final_state = match requested {
                Err(status) => {
                    let state = DaemonState::from_exit(status);
                    tracing::warn!(scope_id = %scope, state = %state.describe(), "Isolated daemon exited");
                    state
                }
                Ok(grace) => {
                    if let Some(pid) = pid {
                        if let Err(e) = ProcessUtils::send_signal(
                            ProcessUtils::i32_to_pid(pid as i32),
                            nix::sys::signal::Signal::SIGTERM,
                        ) {
                            tracing::debug!(scope_id = %scope, "{}", e);
                        }
                    }
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(_) => tracing::debug!(scope_id = %scope, "Isolated daemon stopped gracefully"),
                        Err(_) => {
                            tracing::warn!(scope_id = %scope, "Isolated daemon ignored SIGTERM for {:?}, killing", grace);
                            if let Err(e) = child.kill().await {
                                tracing::warn!(scope_id = %scope, "Failed to kill isolated daemon: {}", e);
                            }
                        }
                    }
                    DaemonState::Stopped
                }
            };
            let _ = state_tx.send(final_state);
        })
    }

    /// Watch a daemon started by an earlier bridger process. Without a PID
    /// the daemon can be observed as running but not stopped.
    pub fn adopt(pid: Option<u32>, scope_id: &str) -> Self {
        let scope = scope_id.to_string();
        Self::monitored(pid, move |state_tx, mut stop_rx| async move {
            let Some(raw) = pid else {
                if let Ok(grace) = stop_rx.await {
                    tracing::warn!(scope_id = %scope, ?grace, "No PID recorded for adopted daemon, leaving it running");
                }
                let _ = state_tx.send(DaemonState::Stopped);
                return;
            };
            let pid = ProcessUtils::i32_to_pid(raw as i32);
            loop {
                tokio::select! {
                    stop = &mut stop_rx => {
                        if let Ok(grace) = stop {
                            if let Err(e) = ProcessUtils::terminate_process(pid, grace, || false).await {
                                tracing::warn!(scope_id = %scope, "Failed to stop adopted daemon: {}", e);
                            }
                            let _ = state_tx.send(DaemonState::Stopped);
                        }
                        return;
                    }
                    _ = tokio::time::sleep(ADOPTED_POLL) => {
                        if !ProcessUtils::is_process_running(pid) {
                            tracing::warn!(scope_id = %scope, pid = raw, "Adopted isolated daemon is gone");
                            let _ = state_tx.send(DaemonState::Error("process disappeared".to_string()));
                            return;
                        }
                    }
                }
            }
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> DaemonState {
        self.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == DaemonState::Running
    }

    /// SIGTERM, then SIGKILL after `grace`. Idempotent.
    pub async fn stop(&mut self, grace: Duration) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(grace);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Daemon monitor task failed: {}", e);
            }
        }
    }
}

/// Filesystem layout of one scope's runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeDirs {
    pub runtime_dir: PathBuf,
    pub socket: PathBuf,
    pub exec_root: PathBuf,
    pub pidfile: PathBuf,
    pub config_file: PathBuf,
    /// Everything persistent for the scope; `data_root` lives inside it
    pub scope_data: PathBuf,
    pub data_root: PathBuf,
}

impl RuntimeDirs {
    pub fn new(socket_dir: &Path, data_dir: &Path, scope_id: &str) -> Self {
        let runtime_dir = socket_dir.join(scope_id);
        Self {
            socket: runtime_dir.join("docker.sock"),
            exec_root: runtime_dir.join("exec"),
            pidfile: runtime_dir.join("docker.pid"),
            config_file: runtime_dir.join("daemon.json"),
            data_root: data_dir.join(scope_id).join("docker"),
            scope_data: data_dir.join(scope_id),
            runtime_dir,
        }
    }

    pub fn docker_host(&self) -> String {
        format!("unix://{}", self.socket.display())
    }

    pub async fn prepare(&self) -> std::io::Result<()> {
        for dir in [&self.runtime_dir, &self.exec_root, &self.data_root] {
            tokio::fs::create_dir_all(dir).await?;
        }
        match tokio::fs::remove_file(&self.socket).await {
            Ok(()) => tracing::debug!(socket = %self.socket.display(), "Removed stale runtime socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Remove runtime state; the data root is kept for the next instance
    pub async fn remove(&self) {
        match tokio::fs::remove_dir_all(&self.runtime_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(dir = %self.runtime_dir.display(), "Failed to remove runtime dir: {}", e),
        }
    }

    pub async fn has_data(&self) -> bool {
        tokio::fs::try_exists(&self.scope_data).await.unwrap_or(false)
    }

    /// Delete the scope's persistent data (images, volumes, containers).
    /// Returns the number of bytes freed.
    pub async fn purge_data(&self) -> std::io::Result<u64> {
        let dir = self.scope_data.clone();
        let size = tokio::task::spawn_blocking(move || dir_size(&dir))
            .await
            .map_err(std::io::Error::other)?;
        match tokio::fs::remove_dir_all(&self.scope_data).await {
            Ok(()) => Ok(size),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// PID recorded by the daemon; anything that is not a positive `pid_t`
    /// is ignored so it can never reach kill(2) as a process group.
    pub async fn read_pid(&self) -> Option<u32> {
        let content = tokio::fs::read_to_string(&self.pidfile).await.ok()?;
        let pid: i32 = content.trim().parse().ok()?;
        u32::try_from(pid).ok().filter(|pid| *pid > 0)
    }
}

fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// `daemon.json` of an isolated runtime. The bridge itself is passed on the
/// command line since `bridge` and `fixed-cidr` must agree with a bridge we
/// created beforehand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(rename = "storage-driver", default, skip_serializing_if = "String::is_empty")]
    pub storage_driver: String,
    #[serde(rename = "log-level", default, skip_serializing_if = "String::is_empty")]
    pub log_level: String,
    #[serde(rename = "fixed-cidr")]
    pub fixed_cidr: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    #[serde(rename = "dns-search", default, skip_serializing_if = "Vec::is_empty")]
    pub dns_search: Vec<String>,
}

impl DaemonConfig {
    pub fn new(addressing: &TenantAddressing, dns: Vec<String>, dns_search: Vec<String>) -> Self {
        Self {
            storage_driver: "overlay2".to_string(),
            log_level: "warn".to_string(),
            fixed_cidr: addressing.subnet(),
            dns,
            dns_search,
        }
    }

    /// Tenant bridge index encoded in `fixed-cidr`, if it is a tenant subnet
    pub fn bridge_index(&self) -> Option<u8> {
        let (network, prefix_len) = parse_ipv4_cidr(&self.fixed_cidr).ok()?;
        let o = network.octets();
        if prefix_len != TENANT_PREFIX_LEN || o[0] != TENANT_NET_OCTETS[0] || o[1] != TENANT_NET_OCTETS[1] {
            return None;
        }
        Some(o[2]).filter(|i| *i >= 1 && *i <= 254)
    }

    pub async fn write(&self, path: &Path) -> std::io::Result<()> {
        let body = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        tokio::fs::write(path, body).await
    }

    pub async fn load(path: &Path) -> std::io::Result<Self> {
        let body = tokio::fs::read(path).await?;
        serde_json::from_slice(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[async_trait]
pub trait DaemonLauncher: Send + Sync {
    /// Start the runtime for a scope bound to `bridge`. Readiness is not awaited.
    async fn launch(&self, scope_id: &str, dirs: &RuntimeDirs, bridge: &str) -> BridgerResult<DaemonHandle>;

    fn adopt(&self, scope_id: &str, pid: Option<u32>) -> DaemonHandle {
        DaemonHandle::adopt(pid, scope_id)
    }
}

pub struct DockerdLauncher {
    program: String,
}

impl DockerdLauncher {
    pub fn new() -> Self {
        Self {
            program: "dockerd".to_string(),
        }
    }

    pub fn args(dirs: &RuntimeDirs, bridge: &str) -> Vec<String> {
        vec![
            format!("--host={}", dirs.docker_host()),
            format!("--data-root={}", dirs.data_root.display()),
            format!("--exec-root={}", dirs.exec_root.display()),
            format!("--pidfile={}", dirs.pidfile.display()),
            format!("--config-file={}", dirs.config_file.display()),
            format!("--bridge={}", bridge),
        ]
    }
}

impl Default for DockerdLauncher {
    fn default() -> Self {
        Self::new()
    }
}

fn relay_output<R>(stream: R, scope_id: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(target: "dockerd", "[dockerd {}] {}", scope_id, line);
        }
    });
}

#[async_trait]
impl DaemonLauncher for DockerdLauncher {
    async fn launch(&self, scope_id: &str, dirs: &RuntimeDirs, bridge: &str) -> BridgerResult<DaemonHandle> {
        let mut child = Command::new(&self.program)
            .args(Self::args(dirs, bridge))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BridgerError::runtime(format!("failed to start {}: {}", self.program, e)))?;

        if let Some(out) = child.stdout.take() {
            relay_output(out, scope_id.to_string());
        }
        if let Some(err) = child.stderr.take() {
            relay_output(err, scope_id.to_string());
        }

        tracing::info!(scope_id, bridge, pid = ?child.id(), "Started isolated daemon");
        Ok(DaemonHandle::from_child(child, scope_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_layout() {
        let dirs = RuntimeDirs::new(Path::new("/run/hydra/active"), Path::new("/hydra-data"), "s1");
        assert_eq!(dirs.socket, PathBuf::from("/run/hydra/active/s1/docker.sock"));
        assert_eq!(dirs.data_root, PathBuf::from("/hydra-data/s1/docker"));
        assert_eq!(dirs.docker_host(), "unix:///run/hydra/active/s1/docker.sock");

        let args = DockerdLauncher::args(&dirs, "hydra4");
        assert_eq!(args.last().map(String::as_str), Some("--bridge=hydra4"));
        assert!(args.contains(&"--pidfile=/run/hydra/active/s1/docker.pid".to_string()));
    }

    #[test]
    fn config_json_shape() {
        let cfg = DaemonConfig::new(
            &TenantAddressing::new(7),
            vec!["10.200.7.1".into()],
            vec!["corp.example".into()],
        );
        let json: serde_json::Value = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["fixed-cidr"], "10.200.7.0/24");
        assert_eq!(json["storage-driver"], "overlay2");
        assert_eq!(json["dns"][0], "10.200.7.1");
        assert_eq!(json["dns-search"][0], "corp.example");
        assert_eq!(cfg.bridge_index(), Some(7));
    }

    #[test]
    fn foreign_cidr_has_no_index() {
        let mut cfg = DaemonConfig::new(&TenantAddressing::new(1), vec![], vec![]);
        cfg.fixed_cidr = "172.18.0.0/16".into();
        assert_eq!(cfg.bridge_index(), None);
        let json = serde_json::to_value(&cfg).unwrap();
        assert!(json.get("dns").is_none());
    }

    #[tokio::test]
    async fn prepare_and_remove_keep_data_root() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = RuntimeDirs::new(&tmp.path().join("run"), &tmp.path().join("data"), "scope-a");
        dirs.prepare().await.unwrap();
        std::fs::write(&dirs.pidfile, "4321\n").unwrap();
        assert_eq!(dirs.read_pid().await, Some(4321));

        DaemonConfig::new(&TenantAddressing::new(3), vec![], vec![])
            .write(&dirs.config_file)
            .await
            .unwrap();
        let loaded = DaemonConfig::load(&dirs.config_file).await.unwrap();
        assert_eq!(loaded.bridge_index(), Some(3));

        dirs.remove().await;
        assert!(!dirs.runtime_dir.exists());
        assert!(dirs.data_root.exists());
    }

    #[tokio::test]
    async fn purge_reports_freed_bytes_and_removes_scope_data() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = RuntimeDirs::new(&tmp.path().join("run"), &tmp.path().join("data"), "s1");
        dirs.prepare().await.unwrap();
        let layer = dirs.data_root.join("overlay2").join("l1");
        tokio::fs::create_dir_all(&layer).await.unwrap();
        tokio::fs::write(layer.join("blob"), vec![0u8; 1500]).await.unwrap();
        tokio::fs::write(dirs.scope_data.join("meta"), b"abc").await.unwrap();

        assert!(dirs.has_data().await);
        assert_eq!(dirs.purge_data().await.unwrap(), 1503);
        assert!(!dirs.has_data().await);
        assert_eq!(dirs.purge_data().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn out_of_range_pids_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = RuntimeDirs::new(&tmp.path().join("run"), &tmp.path().join("data"), "scope-a");
        dirs.prepare().await.unwrap();
        for bogus in ["4294967295", "2147483648", "-1", "0", "abc"] {
            std::fs::write(&dirs.pidfile, bogus).unwrap();
            assert_eq!(dirs.read_pid().await, None, "{}", bogus);
        }
        std::fs::write(&dirs.pidfile, "2147483647").unwrap();
        assert_eq!(dirs.read_pid().await, Some(2147483647));
    }

    #[tokio::test]
    async fn exited_child_is_reported() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let handle = DaemonHandle::from_child(child, "s1");
        let mut rx = handle.state.clone();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s != DaemonState::Running))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(handle.state(), DaemonState::Error(_)));
    }

    #[tokio::test]
    async fn stop_terminates_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut handle = DaemonHandle::from_child(child, "s1");
        assert!(handle.is_running());
        handle.stop(Duration::from_secs(5)).await;
        assert_eq!(handle.state(), DaemonState::Stopped);
        handle.stop(Duration::from_secs(5)).await;
    }
}
