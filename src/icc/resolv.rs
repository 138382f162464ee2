// Host resolver configuration inherited by tenant daemons and resolvers

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use crate::utils::constants::SYSTEMD_RESOLVED_UPSTREAM_CONF;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostResolver {
    pub nameservers: Vec<IpAddr>,
    pub search: Vec<String>,
}

impl HostResolver {
    pub fn parse(content: &str) -> Self {
        let mut resolver = HostResolver::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => {
                    if let Some(ip) = fields.next().and_then(|s| s.parse::<IpAddr>().ok()) {
                        if !resolver.nameservers.contains(&ip) {
                            resolver.nameservers.push(ip);
                        }
                    }
                }
                // Last search/domain line wins, as in the libc resolver
                Some("search") | Some("domain") => {
                    resolver.search = fields.map(str::to_string).collect();
                }
                _ => {}
            }
        }
        resolver
    }

    fn only_loopback(&self) -> bool {
        !self.nameservers.is_empty() && self.nameservers.iter().all(|ip| ip.is_loopback())
    }

    /// Read `path`, following a systemd-resolved stub to its real upstreams.
    pub async fn load(path: &Path) -> std::io::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut resolver = Self::parse(&content);

        if resolver.only_loopback() {
            match tokio::fs::read_to_string(SYSTEMD_RESOLVED_UPSTREAM_CONF).await {
                Ok(upstream) => {
                    let real = Self::parse(&upstream);
                    if !real.nameservers.is_empty() {
                        tracing::debug!(
                            upstreams = ?real.nameservers,
                            "Host uses a local stub resolver, inheriting its upstreams"
                        );
                        resolver.nameservers = real.nameservers;
                        if resolver.search.is_empty() {
                            resolver.search = real.search;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!("No systemd-resolved upstream list: {}", e);
                }
            }
        }
        Ok(resolver)
    }

    /// Where the bridger forwards queries; it runs in the host namespace so
    /// loopback stubs are reachable from here.
    pub fn upstreams(&self) -> Vec<SocketAddr> {
        self.nameservers.iter().map(|ip| SocketAddr::new(*ip, 53)).collect()
    }

    /// Nameservers usable from inside a container's own namespace
    pub fn container_nameservers(&self) -> Vec<IpAddr> {
        self.nameservers
            .iter()
            .filter(|ip| !ip.is_loopback())
            .copied()
            .collect()
    }
}

/// Put `nameserver <server>` first in a resolv.conf, unless it is already listed.
/// Returns `None` when nothing needs to change.
pub fn prepend_nameserver(content: &str, server: IpAddr) -> Option<String> {
    if HostResolver::parse(content).nameservers.contains(&server) {
        return None;
    }
    Some(format!("nameserver {}\n{}", server, content))
}
