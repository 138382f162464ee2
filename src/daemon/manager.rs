//! Tenant network lifecycle: create, bridge, inspect, refresh and tear down.
//!
//! All state for one scope is touched only while that scope's registry lock
//! is held. Bridging a desktop additionally holds the desktop's own lock so
//! a desktop is never half-moved between two scopes. Lock order is always
//! desktop before scope.

use std::convert::Infallible;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::daemon::config::BridgerConfig;
use crate::daemon::provisioner::{DaemonConfig, DaemonHandle, DaemonLauncher, RuntimeDirs};
use crate::daemon::runtime::{ContainerRuntime, RuntimeDirectory};
use crate::icc::network::dns_manager::{DnsHandle, DnsManager, DnsState};
use crate::icc::network::operator::{Namespace, NetworkOperator};
use crate::icc::network::port_mapping::{PortForwarder, PortMapping};
use crate::icc::network::privileged::{PrivilegedBridger, PrivilegedLink};
use crate::icc::network::recovery::{BridgeScanner, RecoveryReport};
use crate::icc::network::veth::{BridgeAttachment, VethBridger};
use crate::icc::resolv::HostResolver;
use crate::sync::error::{BridgerError, BridgerResult};
use crate::sync::instances::{DesktopBinding, ScopeRegistry, TenantNetworkInstance};
use crate::sync::ipam::{BridgeIndexPool, TenantAddressing};
use crate::sync::retry::{retry_until_ready, Readiness, RetryFailure, RetryPolicy};
use crate::utils::process::ProcessUtils;
use crate::utils::validation::InputValidator;

const IP_FORWARD: &str = "net.ipv4.ip_forward";
const DAEMON_POLL: Duration = Duration::from_millis(500);

/// Returned by instance creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    pub scope_id: String,
    pub socket_path: String,
    pub docker_host: String,
    pub bridge_name: String,
    pub bridge_index: u8,
    pub subnet: String,
    pub gateway: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    pub scope_id: String,
    pub bridge_index: u8,
    pub bridge_name: String,
    pub subnet: String,
    pub gateway: Ipv4Addr,
    pub socket_path: String,
    pub desktop_bridged: bool,
    pub desktop_container_id: Option<String>,
    pub forwarded_ports: Vec<PortMapping>,
    /// Isolated daemon state
    pub status: String,
    pub dns: String,
    /// Containers in the tenant runtime, stopped ones included; 0 while
    /// the daemon is not running
    pub container_count: usize,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub scope_id: String,
    pub status: &'static str,
    pub data_deleted_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct BridgeRequest {
    pub scope_id: String,
    pub desktop_container_id: String,
    pub privileged: bool,
    /// Bound on the desktop readiness wait
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
struct PrivilegedBinding {
    link: PrivilegedLink,
    forwarded_ports: Vec<PortMapping>,
}

fn info_of(instance: &TenantNetworkInstance) -> InstanceInfo {
    let a = &instance.addressing;
    InstanceInfo {
        scope_id: instance.scope_id.clone(),
        socket_path: instance.socket_path(),
        docker_host: instance.docker_host(),
        bridge_name: a.bridge_name(),
        bridge_index: a.index,
        subnet: a.subnet(),
        gateway: a.gateway(),
    }
}

fn status_of(instance: &TenantNetworkInstance) -> InstanceStatus {
    let a = &instance.addressing;
    let desktop = instance.desktop.as_ref();
    InstanceStatus {
        scope_id: instance.scope_id.clone(),
        bridge_index: a.index,
        bridge_name: a.bridge_name(),
        subnet: a.subnet(),
        gateway: a.gateway(),
        socket_path: instance.socket_path(),
        desktop_bridged: instance.desktop_bridged(),
        desktop_container_id: desktop.map(|d| d.container_id.clone()),
        forwarded_ports: desktop.map(|d| d.forwarded_ports.clone()).unwrap_or_default(),
        status: instance.daemon.state().describe(),
        dns: instance.dns.state().describe(),
        container_count: 0,
        uptime_seconds: instance.uptime_seconds(),
    }
}

fn validate(kind: &str, value: &str) -> BridgerResult<()> {
    InputValidator::validate_identifier(kind, value).map_err(BridgerError::invalid)
}

pub struct HydraManager {
    config: BridgerConfig,
    net: Arc<dyn NetworkOperator>,
    runtime: Arc<dyn ContainerRuntime>,
    launcher: Arc<dyn DaemonLauncher>,
    pool: BridgeIndexPool,
    registry: ScopeRegistry,
    veth: VethBridger,
    ports: PortForwarder,
    dns: DnsManager,
    privileged: Option<PrivilegedBridger>,
    privileged_links: DashMap<String, PrivilegedBinding>,
}

impl HydraManager {
    pub fn new(
        config: BridgerConfig,
        net: Arc<dyn NetworkOperator>,
        runtime: Arc<dyn ContainerRuntime>,
        launcher: Arc<dyn DaemonLauncher>,
    ) -> BridgerResult<Self> {
        let privileged = if config.privileged_mode {
            let bridger = PrivilegedBridger::new(net.clone(), &config.privileged_subnet)
                .map_err(BridgerError::invalid)?;
            tracing::warn!(
                subnet = %bridger.subnet(),
                "Privileged mode enabled: desktops may join the shared runtime network"
            );
            Some(bridger)
        } else {
            None
        };

        Ok(Self {
            dns: DnsManager::new(config.dns_enabled, config.dns_port),
            veth: VethBridger::new(net.clone()),
            ports: PortForwarder::new(net.clone()),
            pool: BridgeIndexPool::new(),
            registry: ScopeRegistry::new(),
            privileged_links: DashMap::new(),
            privileged,
            config,
            net,
            runtime,
            launcher,
        })
    }

    pub fn active_instances(&self) -> usize {
        self.registry.active_count()
    }

    pub fn bridge_indices_in_use(&self) -> Vec<u8> {
        self.pool.in_use()
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Rebuild in-memory state after a restart. Must complete before the
    /// API starts serving.
    pub async fn recover(&self) -> BridgerResult<RecoveryReport> {
        let scanner = BridgeScanner::new(self.net.clone());
        let report = scanner
            .recover(&self.pool)
            .await
            .map_err(|e| BridgerError::kernel("scan tenant bridges", e))?;
        self.adopt_instances(&report.bridges).await;
        Ok(report)
    }

    /// Scopes whose bridge survived and whose daemon still answers are taken
    /// over with their desktop marked not bridged. Everything else left in
    /// the socket directory is torn down.
    async fn adopt_instances(&self, live_bridges: &[u8]) {
        let mut entries = match tokio::fs::read_dir(&self.config.socket_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(dir = %self.config.socket_dir.display(), "Cannot scan runtime directories: {}", e);
                return;
            }
        };

        let mut adopted: Vec<u8> = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Runtime directory scan aborted: {}", e);
                    break;
                }
            };
            let scope_id = entry.file_name().to_string_lossy().into_owned();
            if validate("scope_id", &scope_id).is_err() {
                continue;
            }
            let dirs = RuntimeDirs::new(&self.config.socket_dir, &self.config.data_dir, &scope_id);
            let index = match DaemonConfig::load(&dirs.config_file).await {
                Ok(cfg) => cfg.bridge_index(),
                Err(e) => {
                    tracing::debug!(scope_id = %scope_id, "No readable daemon.json: {}", e);
                    None
                }
            };

            let alive = match index {
                Some(i) if live_bridges.contains(&i) && !adopted.contains(&i) => {
                    self.runtime.ping(&dirs.docker_host()).await
                }
                _ => false,
            };

            match index {
                Some(i) if alive => {
                    self.adopt(&scope_id, TenantAddressing::new(i), dirs).await;
                    adopted.push(i);
                }
                _ => self.discard_leftover(&scope_id, index, dirs, live_bridges).await,
            }
        }
    }

    async fn adopt(&self, scope_id: &str, addressing: TenantAddressing, dirs: RuntimeDirs) {
        let bridge = addressing.bridge_name();
        if let Err(e) = self.net.install_isolation(&bridge).await {
            tracing::warn!(scope_id, bridge = %bridge, "Failed to reinstall isolation rule: {}", e);
        }
        let pid = dirs.read_pid().await;
        let daemon = self.launcher.adopt(scope_id, pid);
        let dns = self.start_dns(scope_id, &addressing, dirs.docker_host()).await;

        tracing::info!(scope_id, bridge = %bridge, pid = ?pid, "Adopted surviving tenant instance");
        let mut guard = self.registry.lock(scope_id).await;
        guard.insert(TenantNetworkInstance {
            scope_id: scope_id.to_string(),
            addressing,
            dirs,
            daemon,
            dns,
            desktop: None,
            started_at: Instant::now(),
        });
    }

    async fn discard_leftover(&self, scope_id: &str, index: Option<u8>, dirs: RuntimeDirs, live_bridges: &[u8]) {
        tracing::warn!(scope_id, index = ?index, "Discarding tenant instance that did not survive restart");
        if let Some(pid) = dirs.read_pid().await {
            let target = ProcessUtils::i32_to_pid(pid as i32);
            if ProcessUtils::is_process_running(target) {
                let exited = move || !ProcessUtils::is_process_running(target);
                if let Err(e) = ProcessUtils::terminate_process(target, self.config.stop_timeout, exited).await {
                    tracing::warn!(scope_id, pid, "Failed to stop leftover daemon: {}", e);
                }
            }
        }
        if let Some(i) = index.filter(|i| live_bridges.contains(i)) {
            let addressing = TenantAddressing::new(i);
            self.release_network(scope_id, &addressing).await;
        }
        dirs.remove().await;
    }

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    /// Lifecycle changes run on their own task and finish even when the
    /// caller is dropped, so every bridge and daemon they start ends up
    /// either registered or rolled back.
    async fn detached<T, F, Fut>(self: &Arc<Self>, op: F) -> BridgerResult<T>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = BridgerResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(op(Arc::clone(self)))
            .await
            .map_err(|e| BridgerError::runtime(format!("lifecycle task failed: {}", e)))?
    }

    pub async fn create_instance(self: &Arc<Self>, scope_id: &str) -> BridgerResult<InstanceInfo> {
        validate("scope_id", scope_id)?;
        let scope_id = scope_id.to_string();
        self.detached(move |manager| async move { manager.create_locked(&scope_id).await })
            .await
    }

    async fn create_locked(&self, scope_id: &str) -> BridgerResult<InstanceInfo> {
        let mut guard = self.registry.lock(scope_id).await;
        if let Some(existing) = guard.get() {
            if existing.daemon.is_running() {
                tracing::debug!(scope_id, "Instance already exists");
                return Ok(info_of(existing));
            }
        }
        if let Some(mut dead) = guard.take() {
            tracing::warn!(
                scope_id,
                status = %dead.daemon.state().describe(),
                "Isolated daemon is gone, recreating instance"
            );
            if let Err(e) = self.teardown(&mut dead).await {
                guard.insert(dead);
                return Err(e);
            }
        }

        match self.provision(scope_id).await {
            Ok(instance) => {
                let info = info_of(&instance);
                guard.insert(instance);
                Ok(info)
            }
            Err(e) => {
                drop(guard);
                self.registry.prune(scope_id);
                Err(e)
            }
        }
    }

    async fn provision(&self, scope_id: &str) -> BridgerResult<TenantNetworkInstance> {
        let index = self.pool.allocate()?;
        let addressing = TenantAddressing::new(index);
        let bridge = addressing.bridge_name();
        let dirs = RuntimeDirs::new(&self.config.socket_dir, &self.config.data_dir, scope_id);

        if let Err(e) = self.prepare_network(&addressing).await {
            self.release_network(scope_id, &addressing).await;
            return Err(e);
        }

        let (daemon_config, resolver) = self.daemon_config(&addressing).await;
        let written = match dirs.prepare().await {
            Ok(()) => daemon_config.write(&dirs.config_file).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.release_network(scope_id, &addressing).await;
            dirs.remove().await;
            return Err(e.into());
        }

        let mut daemon = match self.launcher.launch(scope_id, &dirs, &bridge).await {
            Ok(daemon) => daemon,
            Err(e) => {
                self.release_network(scope_id, &addressing).await;
                dirs.remove().await;
                return Err(e);
            }
        };

        let host = dirs.docker_host();
        if let Err(e) = self.wait_for_daemon(scope_id, &daemon, &host).await {
            daemon.stop(self.config.stop_timeout).await;
            self.release_network(scope_id, &addressing).await;
            dirs.remove().await;
            return Err(e);
        }

        let dns = self.start_dns_with(scope_id, &addressing, host, &resolver).await;
        tracing::info!(
            scope_id,
            bridge = %bridge,
            subnet = %addressing.subnet(),
            dns = %dns.state().describe(),
            "Tenant instance ready"
        );

        Ok(TenantNetworkInstance {
            scope_id: scope_id.to_string(),
            addressing,
            dirs,
            daemon,
            dns,
            desktop: None,
            started_at: Instant::now(),
        })
    }

    /// Bridge, forwarding and isolation for a fresh index
    async fn prepare_network(&self, addressing: &TenantAddressing) -> BridgerResult<()> {
        let bridge = addressing.bridge_name();
        self.net
            .create_bridge(&bridge, addressing.gateway(), addressing.prefix_len())
            .await
            .map_err(|e| {
                BridgerError::kernel(
                    format!("create bridge {} with {}/{}", bridge, addressing.gateway(), addressing.prefix_len()),
                    e,
                )
            })?;
        if let Err(e) = self.net.set_sysctl(Namespace::Host, IP_FORWARD, "1").await {
            tracing::warn!(bridge = %bridge, "Failed to enable IP forwarding: {}", e);
        }
        self.net
            .install_isolation(&bridge)
            .await
            .map_err(|e| BridgerError::kernel(format!("install isolation for {}", bridge), e))?;
        tracing::info!(bridge = %bridge, subnet = %addressing.subnet(), "Tenant bridge created");
        Ok(())
    }

    /// Undo `prepare_network` and return the index. Best-effort: a bridge
    /// that cannot be deleted keeps its index reserved.
    async fn release_network(&self, scope_id: &str, addressing: &TenantAddressing) {
        let bridge = addressing.bridge_name();
        if let Err(e) = self.net.remove_isolation(&bridge).await {
            tracing::warn!(scope_id, bridge = %bridge, "Failed to remove isolation rule: {}", e);
        }
        match self.net.delete_interface(&bridge).await {
            Ok(()) => self.pool.release(addressing.index),
            Err(e) => {
                tracing::error!(scope_id, bridge = %bridge, "Failed to delete bridge, index stays reserved: {}", e)
            }
        }
    }

    async fn host_resolver(&self) -> HostResolver {
        match HostResolver::load(&self.config.resolv_conf).await {
            Ok(resolver) => resolver,
            Err(e) => {
                tracing::warn!(path = %self.config.resolv_conf.display(), "Cannot read host resolver config: {}", e);
                HostResolver::default()
            }
        }
    }

    async fn daemon_config(&self, addressing: &TenantAddressing) -> (DaemonConfig, HostResolver) {
        let resolver = self.host_resolver().await;
        let dns = if self.dns.enabled() {
            vec![addressing.gateway().to_string()]
        } else {
            resolver
                .container_nameservers()
                .iter()
                .map(ToString::to_string)
                .collect()
        };
        let config = DaemonConfig::new(addressing, dns, resolver.search.clone());
        (config, resolver)
    }

    async fn wait_for_daemon(
        &self,
        scope_id: &str,
        daemon: &DaemonHandle,
        host: &str,
    ) -> BridgerResult<()> {
        let started = Instant::now();
        let policy = RetryPolicy::constant(DAEMON_POLL, self.config.dockerd_timeout);
        let runtime = &self.runtime;

        let outcome = retry_until_ready(policy, "isolated daemon", || async move {
            if !daemon.is_running() {
                return Readiness::Fatal(daemon.state().describe());
            }
            if runtime.ping(host).await {
                Readiness::Ready(())
            } else {
                Readiness::NotYet(format!("{} not responding", host))
            }
        })
        .await;

        outcome.map_err(|failure| {
            let reason = match failure {
                RetryFailure::Exhausted { last_reason, .. } => last_reason,
                RetryFailure::Fatal(state) => format!("daemon exited ({})", state),
            };
            tracing::error!(scope_id, reason = %reason, "Isolated daemon did not become ready");
            BridgerError::DaemonStartTimeout {
                scope_id: scope_id.to_string(),
                waited: started.elapsed(),
                reason,
            }
        })
    }

    async fn start_dns(&self, scope_id: &str, addressing: &TenantAddressing, docker_host: String) -> DnsHandle {
        if !self.dns.enabled() {
            return DnsHandle::disabled();
        }
        let resolver = self.host_resolver().await;
        self.start_dns_with(scope_id, addressing, docker_host, &resolver).await
    }

    async fn start_dns_with(
        &self,
        scope_id: &str,
        addressing: &TenantAddressing,
        docker_host: String,
        resolver: &HostResolver,
    ) -> DnsHandle {
        let directory = Arc::new(RuntimeDirectory::new(self.runtime.clone(), docker_host));
        self.dns
            .start(scope_id, addressing.gateway(), directory, resolver.upstreams())
            .await
    }

    pub async fn delete_instance(self: &Arc<Self>, scope_id: &str) -> BridgerResult<()> {
        validate("scope_id", scope_id)?;
        let scope_id = scope_id.to_string();
        self.detached(move |manager| async move { manager.delete_locked(&scope_id).await })
            .await
    }

    async fn delete_locked(&self, scope_id: &str) -> BridgerResult<()> {
        let unknown = || BridgerError::UnknownScope {
            scope_id: scope_id.to_string(),
        };

        let mut guard = self.registry.lock_existing(scope_id).await.ok_or_else(unknown)?;
        let Some(mut instance) = guard.take() else {
            drop(guard);
            self.registry.prune(scope_id);
            return Err(unknown());
        };

        match self.teardown(&mut instance).await {
            Ok(()) => {
                drop(guard);
                self.registry.prune(scope_id);
                tracing::info!(scope_id, "Tenant instance deleted");
                Ok(())
            }
            Err(e) => {
                guard.insert(instance);
                Err(e)
            }
        }
    }

    /// Resolver, desktop, daemon, isolation, bridge, in that order. Only a
    /// bridge that refuses deletion fails the teardown; the instance then
    /// keeps its index so a later delete can retry.
    async fn teardown(&self, instance: &mut TenantNetworkInstance) -> BridgerResult<()> {
        let scope_id = instance.scope_id.clone();
        let bridge = instance.addressing.bridge_name();

        instance.dns.stop().await;
        if let Some(binding) = instance.desktop.take() {
            self.release_desktop(&scope_id, &binding).await;
        }
        instance.daemon.stop(self.config.stop_timeout).await;

        if let Err(e) = self.net.remove_isolation(&bridge).await {
            tracing::warn!(scope_id = %scope_id, bridge = %bridge, "Failed to remove isolation rule: {}", e);
        }
        self.net
            .delete_interface(&bridge)
            .await
            .map_err(|e| BridgerError::kernel(format!("delete bridge {}", bridge), e))?;

        self.pool.release(instance.addressing.index);
        instance.dirs.remove().await;
        Ok(())
    }

    /// Delete the instance if there is one, then the scope's persistent
    /// data. A scope with neither is unknown.
    pub async fn purge_instance(self: &Arc<Self>, scope_id: &str) -> BridgerResult<PurgeReport> {
        validate("scope_id", scope_id)?;
        let scope_id = scope_id.to_string();
        self.detached(move |manager| async move { manager.purge_locked(&scope_id).await })
            .await
    }

    async fn purge_locked(&self, scope_id: &str) -> BridgerResult<PurgeReport> {
        let dirs = RuntimeDirs::new(&self.config.socket_dir, &self.config.data_dir, scope_id);
        let mut guard = self.registry.lock(scope_id).await;
        let existed = match guard.take() {
            Some(mut instance) => {
                if let Err(e) = self.teardown(&mut instance).await {
                    guard.insert(instance);
                    return Err(e);
                }
                true
            }
            None => false,
        };
        if !existed && !dirs.has_data().await {
            drop(guard);
            self.registry.prune(scope_id);
            return Err(BridgerError::UnknownScope {
                scope_id: scope_id.to_string(),
            });
        }

        let purged = dirs.purge_data().await;
        drop(guard);
        self.registry.prune(scope_id);
        let data_deleted_bytes = purged?;
        tracing::info!(scope_id, instance_deleted = existed, data_deleted_bytes, "Tenant data purged");
        Ok(PurgeReport {
            scope_id: scope_id.to_string(),
            status: "purged",
            data_deleted_bytes,
        })
    }

    /// Tear down every instance whose daemon has exited. Returns the scopes
    /// that were reclaimed.
    pub async fn reap_dead_instances(&self) -> Vec<String> {
        let mut reaped = Vec::new();
        for scope_id in self.registry.scope_ids() {
            let Some(mut guard) = self.registry.lock_existing(&scope_id).await else {
                continue;
            };
            let dead = guard.get().is_some_and(|instance| !instance.daemon.is_running());
            if !dead {
                continue;
            }
            let Some(mut instance) = guard.take() else {
                continue;
            };
            let status = instance.daemon.state().describe();
            match self.teardown(&mut instance).await {
                Ok(()) => {
                    drop(guard);
                    self.registry.prune(&scope_id);
                    tracing::info!(scope_id = %scope_id, status = %status, "Reclaimed tenant instance with dead daemon");
                    reaped.push(scope_id);
                }
                Err(e) => {
                    tracing::warn!(scope_id = %scope_id, "Cannot reclaim dead tenant instance: {}", e);
                    guard.insert(instance);
                }
            }
        }
        reaped
    }

    /// Reap dead instances every `every` until the returned task is aborted
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reaped = manager.reap_dead_instances().await;
                if !reaped.is_empty() {
                    tracing::info!(count = reaped.len(), scopes = ?reaped, "Dead tenant instances reclaimed");
                }
            }
        })
    }

    async fn with_container_count(&self, mut status: InstanceStatus, running: bool, host: &str) -> InstanceStatus {
        if running {
            status.container_count = match self.runtime.container_count(host).await {
                Ok(count) => count,
                Err(e) => {
                    tracing::debug!(scope_id = %status.scope_id, "Cannot count containers: {}", e);
                    0
                }
            };
        }
        status
    }

    /// Snapshot under the scope lock; the runtime is queried after it is released
    async fn status_snapshot(&self, scope_id: &str) -> Option<(InstanceStatus, bool, String)> {
        let guard = self.registry.lock_existing(scope_id).await?;
        let instance = guard.get()?;
        Some((status_of(instance), instance.daemon.is_running(), instance.docker_host()))
    }

    pub async fn status(&self, scope_id: &str) -> BridgerResult<InstanceStatus> {
        validate("scope_id", scope_id)?;
        let (status, running, host) = self
            .status_snapshot(scope_id)
            .await
            .ok_or_else(|| BridgerError::UnknownScope {
                scope_id: scope_id.to_string(),
            })?;
        Ok(self.with_container_count(status, running, &host).await)
    }

    pub async fn list(&self) -> Vec<InstanceStatus> {
        let mut out = Vec::new();
        for scope_id in self.registry.scope_ids() {
            if let Some((status, running, host)) = self.status_snapshot(&scope_id).await {
                out.push(self.with_container_count(status, running, &host).await);
            }
        }
        out
    }

    /// Restart only the scope's resolver; bridging state is untouched
    pub async fn restart_dns(&self, scope_id: &str) -> BridgerResult<String> {
        validate("scope_id", scope_id)?;
        let mut guard = self.registry.lock_existing(scope_id).await;
        let instance = guard
            .as_mut()
            .and_then(|g| g.get_mut())
            .ok_or_else(|| BridgerError::UnknownScope {
                scope_id: scope_id.to_string(),
            })?;

        instance.dns.stop().await;
        instance.dns = self
            .start_dns(scope_id, &instance.addressing, instance.docker_host())
            .await;
        let state = instance.dns.state().describe();
        tracing::info!(scope_id, dns = %state, "DNS responder restarted");
        Ok(state)
    }

    pub async fn refresh_ports(&self, scope_id: &str) -> BridgerResult<Vec<PortMapping>> {
        validate("scope_id", scope_id)?;
        let mut guard = self.registry.lock_existing(scope_id).await;
        let instance = guard
            .as_mut()
            .and_then(|g| g.get_mut())
            .ok_or_else(|| BridgerError::UnknownScope {
                scope_id: scope_id.to_string(),
            })?;

        let host = instance.docker_host();
        let binding = instance
            .desktop
            .as_mut()
            .ok_or_else(|| BridgerError::invalid(format!("no desktop is bridged to scope {}", scope_id)))?;

        let published = self.runtime.published_ports(&host).await?;
        binding.forwarded_ports = self
            .ports
            .refresh(binding.pid, binding.attachment.gateway, &published, &binding.forwarded_ports)
            .await;
        Ok(binding.forwarded_ports.clone())
    }

    // ------------------------------------------------------------------
    // Desktop bridging
    // ------------------------------------------------------------------

    pub async fn bridge_desktop(&self, request: &BridgeRequest) -> BridgerResult<BridgeAttachment> {
        let scope_id = request.scope_id.as_str();
        let container_id = request.desktop_container_id.as_str();
        validate("scope_id", scope_id)?;
        validate("desktop_container_id", container_id)?;
        if request.privileged && self.privileged.is_none() {
            return Err(BridgerError::PrivilegedModeDisabled);
        }

        let pid = self.resolve_desktop_pid(container_id, request.timeout).await?;
        let _desktop = self.registry.lock_desktop(container_id).await;

        if request.privileged {
            return self.bridge_privileged(container_id, pid).await;
        }
        // Checked before the desktop leaves its current scope
        self.ensure_bridgeable(scope_id).await?;
        self.drop_privileged(container_id).await;

        if let Some(owner) = self.registry.desktop_owner(container_id) {
            if owner != scope_id {
                tracing::info!(
                    container_id,
                    from = %owner,
                    to = scope_id,
                    "Moving desktop to another tenant network"
                );
                self.unbridge_from(&owner, container_id).await;
            }
        }

        let unknown = || BridgerError::UnknownScope {
            scope_id: scope_id.to_string(),
        };
        let mut guard = self.registry.lock_existing(scope_id).await.ok_or_else(unknown)?;
        let instance = guard.get_mut().ok_or_else(unknown)?;
        if !instance.daemon.is_running() {
            return Err(BridgerError::ScopeNotRunning {
                scope_id: scope_id.to_string(),
                status: instance.daemon.state().describe(),
            });
        }

        if let Some(current) = &instance.desktop {
            if current.container_id == container_id && current.pid == pid {
                tracing::debug!(scope_id, container_id, pid, "Desktop already bridged");
                return Ok(current.attachment.clone());
            }
        }

        if let Some(stale) = instance.desktop.take() {
            tracing::info!(
                scope_id,
                container_id = %stale.container_id,
                old_pid = stale.pid,
                new_pid = pid,
                veth = %stale.veth_bridge_name,
                "Desktop was recreated, replacing stale veth"
            );
            self.release_desktop(scope_id, &stale).await;
        }

        let attachment = self.veth.attach(&instance.addressing, pid).await?;

        if self.dns.enabled() && instance.dns.state().needs_restart() {
            tracing::info!(scope_id, dns = %instance.dns.state().describe(), "Restarting DNS responder");
            instance.dns.stop().await;
            instance.dns = self
                .start_dns(scope_id, &instance.addressing, instance.docker_host())
                .await;
        }
        if self.config.desktop_resolver_entry && instance.dns.state() == DnsState::Running {
            self.point_desktop_resolver(scope_id, pid, attachment.gateway).await;
        }

        let forwarded_ports = match self.runtime.published_ports(&instance.docker_host()).await {
            Ok(published) => self.ports.refresh(pid, attachment.gateway, &published, &[]).await,
            Err(e) => {
                tracing::warn!(scope_id, "Cannot list published ports, skipping forwarding: {}", e);
                Vec::new()
            }
        };

        instance.desktop = Some(DesktopBinding {
            container_id: container_id.to_string(),
            pid,
            veth_bridge_name: instance.addressing.veth_bridge_name(),
            attachment: attachment.clone(),
            forwarded_ports,
        });
        self.registry.set_desktop_owner(container_id, scope_id);
        Ok(attachment)
    }

    async fn ensure_bridgeable(&self, scope_id: &str) -> BridgerResult<()> {
        let guard = self.registry.lock_existing(scope_id).await;
        match guard.as_ref().and_then(|g| g.get()) {
            None => Err(BridgerError::UnknownScope {
                scope_id: scope_id.to_string(),
            }),
            Some(instance) if !instance.daemon.is_running() => Err(BridgerError::ScopeNotRunning {
                scope_id: scope_id.to_string(),
                status: instance.daemon.state().describe(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// Wait for the desktop to be running and return its PID. No locks are
    /// held here; this is the only wait in the bridging path.
    async fn resolve_desktop_pid(&self, container_id: &str, timeout: Option<Duration>) -> BridgerResult<u32> {
        let policy = RetryPolicy::new(self.config.readiness_attempts, self.config.readiness_base_delay)
            .with_deadline(timeout);
        let runtime = &self.runtime;
        let host = self.config.desktop_docker_host.as_str();

        let outcome = retry_until_ready(policy, "desktop container", || async move {
            match runtime.container_pid(host, container_id).await {
                Ok(Some(pid)) => Readiness::<u32, Infallible>::Ready(pid),
                Ok(None) => Readiness::NotYet("container is not running".to_string()),
                Err(reason) => Readiness::NotYet(reason),
            }
        })
        .await;

        outcome.map_err(|failure| match failure {
            RetryFailure::Exhausted {
                attempts,
                last_reason,
                waited,
            } => BridgerError::ContainerNotReady {
                container_id: container_id.to_string(),
                reason: format!("{} ({} attempts over {:?})", last_reason, attempts, waited),
            },
            RetryFailure::Fatal(never) => match never {},
        })
    }

    /// Undo one desktop binding: forwarding rules first while the namespace
    /// may still be alive, then the veth, then ownership.
    async fn release_desktop(&self, scope_id: &str, binding: &DesktopBinding) {
        self.ports
            .clear(binding.pid, binding.attachment.gateway, &binding.forwarded_ports)
            .await;
        self.veth.remove_bridge_side(&binding.veth_bridge_name).await;
        self.registry.clear_desktop_owner(&binding.container_id, scope_id);
    }

    async fn unbridge_from(&self, scope_id: &str, container_id: &str) {
        let Some(mut guard) = self.registry.lock_existing(scope_id).await else {
            self.registry.clear_desktop_owner(container_id, scope_id);
            return;
        };
        let Some(instance) = guard.get_mut() else {
            self.registry.clear_desktop_owner(container_id, scope_id);
            return;
        };
        let bound_here = instance
            .desktop
            .as_ref()
            .is_some_and(|d| d.container_id == container_id);
        if !bound_here {
            self.registry.clear_desktop_owner(container_id, scope_id);
            return;
        }
        if let Some(binding) = instance.desktop.take() {
            self.release_desktop(scope_id, &binding).await;
            tracing::info!(scope_id, container_id, "Desktop un-bridged");
        }
    }

    async fn point_desktop_resolver(&self, scope_id: &str, pid: u32, gateway: Ipv4Addr) {
        let path = DnsManager::desktop_resolv_conf(pid);
        match DnsManager::prepend_resolver(&path, gateway).await {
            Ok(true) => tracing::info!(scope_id, pid, nameserver = %gateway, "Desktop resolver points at tenant DNS"),
            Ok(false) => tracing::debug!(scope_id, pid, "Desktop resolver already configured"),
            Err(e) => tracing::warn!(scope_id, pid, path = %path.display(), "Failed to update desktop resolver: {}", e),
        }
    }

    async fn bridge_privileged(&self, container_id: &str, pid: u32) -> BridgerResult<BridgeAttachment> {
        let bridger = self.privileged.as_ref().ok_or(BridgerError::PrivilegedModeDisabled)?;

        let existing = self.privileged_links.get(container_id).map(|b| b.value().clone());
        if let Some(binding) = existing {
            if binding.link.pid == pid {
                tracing::debug!(container_id, pid, "Desktop already bridged in privileged mode");
                return Ok(binding.link.attachment);
            }
            tracing::info!(container_id, old_pid = binding.link.pid, new_pid = pid, "Desktop was recreated");
            self.drop_privileged(container_id).await;
        }

        if let Some(owner) = self.registry.desktop_owner(container_id) {
            self.unbridge_from(&owner, container_id).await;
        }

        let link = bridger.attach(pid).await?;
        let gateway = link.attachment.gateway;
        let forwarded_ports = match self.runtime.published_ports(&self.config.desktop_docker_host).await {
            Ok(published) => self.ports.refresh(pid, gateway, &published, &[]).await,
            Err(e) => {
                tracing::warn!(container_id, "Cannot list published ports, skipping forwarding: {}", e);
                Vec::new()
            }
        };

        let attachment = link.attachment.clone();
        self.privileged_links.insert(
            container_id.to_string(),
            PrivilegedBinding {
                link,
                forwarded_ports,
            },
        );
        Ok(attachment)
    }

    async fn drop_privileged(&self, container_id: &str) {
        let Some((_, binding)) = self.privileged_links.remove(container_id) else {
            return;
        };
        self.ports
            .clear(binding.link.pid, binding.link.attachment.gateway, &binding.forwarded_ports)
            .await;
        if let Some(bridger) = &self.privileged {
            bridger.detach(&binding.link).await;
        }
    }
}
