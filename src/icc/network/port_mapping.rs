use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::icc::network::operator::{Namespace, NatRule, NetworkOperator};
use crate::utils::constants::DESKTOP_INTERFACE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A port a tenant container publishes on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

const ROUTE_LOCALNET: &str = "net.ipv4.conf.all.route_localnet";

/// Makes `127.0.0.1:<port>` inside the desktop reach `<gateway>:<port>`.
///
/// Rules live in the desktop namespace's `nat` table. Everything here is
/// best-effort: failures are logged and the port is skipped.
pub struct PortForwarder {
    net: Arc<dyn NetworkOperator>,
}

impl PortForwarder {
    pub fn new(net: Arc<dyn NetworkOperator>) -> Self {
        Self { net }
    }

    pub fn loopback_rule(mapping: &PortMapping, gateway: Ipv4Addr) -> NatRule {
        let port = mapping.host_port.to_string();
        NatRule::new(
            "OUTPUT",
            vec![
                "-o".to_string(),
                "lo".to_string(),
                "-d".to_string(),
                "127.0.0.1".to_string(),
                "-p".to_string(),
                mapping.protocol.as_str().to_string(),
                "--dport".to_string(),
                port.clone(),
                "-j".to_string(),
                "DNAT".to_string(),
                "--to-destination".to_string(),
                format!("{}:{}", gateway, port),
            ],
        )
    }

    /// Loopback-sourced packets leaving on the bridge link need a real source address
    pub fn masquerade_rule() -> NatRule {
        NatRule::new(
            "POSTROUTING",
            ["-s", "127.0.0.0/8", "-o", DESKTOP_INTERFACE, "-j", "MASQUERADE"],
        )
    }

    /// One rule per (host port, protocol); the same host port can appear once per
    /// address family or once per published interface in runtime output.
    pub fn dedupe(mappings: &[PortMapping]) -> Vec<PortMapping> {
        let mut seen = BTreeSet::new();
        let mut out: Vec<PortMapping> = mappings
            .iter()
            .filter(|m| m.host_port != 0 && seen.insert((m.host_port, m.protocol)))
            .copied()
            .collect();
        out.sort();
        out
    }

    /// Install rules for `mappings` and drop rules for ports from `previous`
    /// that are no longer published. Returns the ports actually forwarded.
    pub async fn refresh(
        &self,
        pid: u32,
        gateway: Ipv4Addr,
        mappings: &[PortMapping],
        previous: &[PortMapping],
    ) -> Vec<PortMapping> {
        let ns = Namespace::Process(pid);
        let wanted = Self::dedupe(mappings);

        if let Err(e) = self.net.set_sysctl(ns, ROUTE_LOCALNET, "1").await {
            tracing::warn!(pid, "Failed to enable route_localnet in desktop: {}", e);
        }
        if let Err(e) = self.net.install_nat_rule(ns, &Self::masquerade_rule()).await {
            tracing::warn!(pid, "Failed to install loopback masquerade in desktop: {}", e);
        }

        for stale in previous.iter().filter(|p| !wanted.iter().any(|w| Self::same_rule(w, p))) {
            let rule = Self::loopback_rule(stale, gateway);
            if let Err(e) = self.net.remove_nat_rule(ns, &rule).await {
                tracing::warn!(pid, port = stale.host_port, "Failed to remove stale forward: {}", e);
            }
        }

        let mut forwarded = Vec::with_capacity(wanted.len());
        for mapping in wanted {
            let rule = Self::loopback_rule(&mapping, gateway);
            match self.net.install_nat_rule(ns, &rule).await {
                Ok(()) => {
                    tracing::debug!(
                        pid,
                        port = mapping.host_port,
                        protocol = mapping.protocol.as_str(),
                        "Forwarding localhost to {}",
                        gateway
                    );
                    forwarded.push(mapping);
                }
                Err(e) => {
                    tracing::warn!(
                        pid,
                        port = mapping.host_port,
                        protocol = mapping.protocol.as_str(),
                        "Skipping port forward: {}",
                        e
                    );
                }
            }
        }

        if !forwarded.is_empty() {
            tracing::info!(pid, count = forwarded.len(), gateway = %gateway, "Port forwarding refreshed");
        }
        forwarded
    }

    /// Remove the forwarding rules of a desktop that is being un-bridged
    pub async fn clear(&self, pid: u32, gateway: Ipv4Addr, mappings: &[PortMapping]) {
        let ns = Namespace::Process(pid);
        for mapping in mappings {
            let rule = Self::loopback_rule(mapping, gateway);
            if let Err(e) = self.net.remove_nat_rule(ns, &rule).await {
                tracing::debug!(pid, port = mapping.host_port, "Forward rule not removed: {}", e);
            }
        }
    }

    fn same_rule(a: &PortMapping, b: &PortMapping) -> bool {
        a.host_port == b.host_port && a.protocol == b.protocol
    }
}
