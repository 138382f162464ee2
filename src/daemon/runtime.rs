// Container runtime client: the desktop's runtime and each tenant's isolated one

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerInspectResponse, ContainerSummary, PortTypeEnum};
use bollard::{Docker, API_DEFAULT_VERSION};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::icc::dns::{normalize_name, ContainerDirectory};
use crate::icc::network::port_mapping::{PortMapping, Protocol};
use crate::sync::error::{BridgerError, BridgerResult};

const DIRECTORY_TTL: Duration = Duration::from_secs(2);
const API_TIMEOUT_SECS: u64 = 10;
const SHORT_ID_LEN: usize = 12;
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// PID of a running container; `Ok(None)` while it exists but is not running.
    /// `Err` carries a reason suitable for a not-ready report.
    async fn container_pid(&self, host: &str, container_id: &str) -> Result<Option<u32>, String>;

    async fn published_ports(&self, host: &str) -> BridgerResult<Vec<PortMapping>>;

    /// Running containers by name (without `/`), short id and compose
    /// service and network aliases
    async fn container_addresses(&self, host: &str) -> BridgerResult<HashMap<String, Ipv4Addr>>;

    /// All containers the daemon knows about, stopped ones included
    async fn container_count(&self, host: &str) -> BridgerResult<usize>;

    async fn ping(&self, host: &str) -> bool;
}

fn running_pid(info: &ContainerInspectResponse) -> Option<u32> {
    let state = info.state.as_ref()?;
    if state.running != Some(true) {
        return None;
    }
    state
        .pid
        .and_then(|pid| i32::try_from(pid).ok())
        .and_then(|pid| u32::try_from(pid).ok())
        .filter(|pid| *pid > 0)
}

/// Published ports of running containers; unpublished ports are skipped and
/// the per-address-family duplicates collapse into one mapping
fn ports_from_summaries(containers: &[ContainerSummary]) -> Vec<PortMapping> {
    let mut mappings: Vec<PortMapping> = containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .filter_map(|port| {
            let protocol = match port.typ {
                Some(PortTypeEnum::UDP) => Protocol::Udp,
                Some(PortTypeEnum::TCP) | None => Protocol::Tcp,
                Some(_) => return None,
            };
            Some(PortMapping {
                host_port: port.public_port.filter(|p| *p > 0)?,
                container_port: port.private_port,
                protocol,
            })
        })
        .collect();
    mappings.sort();
    mappings.dedup();
    mappings
}

fn addresses_from_summaries(containers: &[ContainerSummary]) -> HashMap<String, Ipv4Addr> {
    let mut out = HashMap::new();
    for c in containers {
        let endpoints: Vec<_> = c
            .network_settings
            .as_ref()
            .and_then(|n| n.networks.as_ref())
            .map(|n| n.values().collect())
            .unwrap_or_default();

        let ip = endpoints
            .iter()
            .filter_map(|e| e.ip_address.as_deref())
            .find_map(|s| s.parse::<Ipv4Addr>().ok());
        let Some(ip) = ip else { continue };

        let mut names: Vec<String> = c
            .names
            .iter()
            .flatten()
            .map(|n| n.trim_start_matches('/').to_string())
            .collect();
        if let Some(id) = &c.id {
            names.push(id.chars().take(SHORT_ID_LEN).collect());
        }
        if let Some(service) = c.labels.as_ref().and_then(|l| l.get(COMPOSE_SERVICE_LABEL)) {
            names.push(service.clone());
        }
        for e in &endpoints {
            names.extend(e.aliases.iter().flatten().cloned());
        }

        for name in names.into_iter().filter(|n| !n.is_empty()) {
            out.entry(normalize_name(&name)).or_insert(ip);
        }
    }
    out
}

fn connect(host: &str) -> Result<Docker, DockerError> {
    if host.starts_with("unix://") || host.starts_with('/') {
        Docker::connect_with_unix(host, API_TIMEOUT_SECS, API_DEFAULT_VERSION)
    } else {
        Docker::connect_with_http(host, API_TIMEOUT_SECS, API_DEFAULT_VERSION)
    }
}

/// Talks to Docker-compatible daemons over their API sockets, one client
/// per daemon address
pub struct DockerApi {
    clients: DashMap<String, Docker>,
}

impl DockerApi {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    fn client(&self, host: &str) -> BridgerResult<Docker> {
        if let Some(docker) = self.clients.get(host) {
            return Ok(docker.clone());
        }
        let docker = connect(host)
            .map_err(|e| BridgerError::runtime(format!("cannot reach container runtime at {}: {}", host, e)))?;
        self.clients.insert(host.to_string(), docker.clone());
        Ok(docker)
    }

    async fn list(&self, host: &str, all: bool) -> BridgerResult<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        self.client(host)?
            .list_containers(Some(options))
            .await
            .map_err(|e| BridgerError::runtime(format!("listing containers on {} failed: {}", host, e)))
    }
}

impl Default for DockerApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerApi {
    async fn container_pid(&self, host: &str, container_id: &str) -> Result<Option<u32>, String> {
        let docker = self.client(host).map_err(|e| e.to_string())?;
        match docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(running_pid(&info)),
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => {
                Err(format!("container {} does not exist", container_id))
            }
            Err(e) => Err(e.to_string()),
        }
    }

    async fn published_ports(&self, host: &str) -> BridgerResult<Vec<PortMapping>> {
        Ok(ports_from_summaries(&self.list(host, false).await?))
    }

    async fn container_addresses(&self, host: &str) -> BridgerResult<HashMap<String, Ipv4Addr>> {
        Ok(addresses_from_summaries(&self.list(host, false).await?))
    }

    async fn container_count(&self, host: &str) -> BridgerResult<usize> {
        Ok(self.list(host, true).await?.len())
    }

    async fn ping(&self, host: &str) -> bool {
        let reachable = match self.client(host) {
            Ok(docker) => docker.ping().await.is_ok(),
            Err(_) => false,
        };
        if !reachable {
            // A daemon restarted on the same socket gets a fresh client
            self.clients.remove(host);
        }
        reachable
    }
}

/// Names the tenant resolver answers for, read from the tenant's runtime
/// and cached briefly so query bursts do not each hit the daemon.
pub struct RuntimeDirectory {
    runtime: Arc<dyn ContainerRuntime>,
    host: String,
    cache: Mutex<Option<(Instant, Arc<HashMap<String, Ipv4Addr>>)>>,
}

impl RuntimeDirectory {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, host: String) -> Self {
        Self {
            runtime,
            host,
            cache: Mutex::new(None),
        }
    }

    async fn snapshot(&self) -> Arc<HashMap<String, Ipv4Addr>> {
        let cached = self
            .cache
            .lock()
            .as_ref()
            .filter(|(at, _)| at.elapsed() < DIRECTORY_TTL)
            .map(|(_, names)| names.clone());
        if let Some(names) = cached {
            return names;
        }
        let names = match self.runtime.container_addresses(&self.host).await {
            Ok(names) => Arc::new(names),
            Err(e) => {
                tracing::debug!(host = %self.host, "Container lookup failed: {}", e);
                Arc::new(HashMap::new())
            }
        };
        *self.cache.lock() = Some((Instant::now(), names.clone()));
        names
    }
}

#[async_trait]
impl ContainerDirectory for RuntimeDirectory {
    async fn lookup(&self, name: &str) -> Option<Ipv4Addr> {
        self.snapshot().await.get(name).copied()
    }
}
