// Privileged mode: the desktop joins the shared runtime network instead of a tenant bridge

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::icc::network::operator::{Namespace, NatRule, NetworkOperator, Route};
use crate::icc::network::veth::BridgeAttachment;
use crate::sync::error::{BridgerError, BridgerResult};
use crate::sync::ipam::{high_host, parse_ipv4_cidr};
use crate::utils::constants::{
    DESKTOP_INTERFACE, PRIVILEGED_DESKTOP_OFFSET, PRIVILEGED_SANDBOX_OFFSET,
    PRIVILEGED_VETH_DESKTOP_PREFIX, PRIVILEGED_VETH_SANDBOX_PREFIX,
};

/// A live privileged-mode bridge for one desktop process
#[derive(Debug, Clone)]
pub struct PrivilegedLink {
    pub pid: u32,
    pub sandbox_veth: String,
    pub attachment: BridgeAttachment,
}

/// Point-to-point veth between the bridger namespace and the desktop.
///
/// The bridger-side end takes the second-highest address of the shared
/// subnet and routes for the desktop; the desktop end takes the highest as a
/// /32 so no connected route for the whole subnet appears in the desktop.
pub struct PrivilegedBridger {
    net: Arc<dyn NetworkOperator>,
    network: Ipv4Addr,
    prefix_len: u8,
}

impl PrivilegedBridger {
    pub fn new(net: Arc<dyn NetworkOperator>, subnet: &str) -> Result<Self, String> {
        let (network, prefix_len) = parse_ipv4_cidr(subnet)?;
        Ok(Self {
            net,
            network,
            prefix_len,
        })
    }

    pub fn subnet(&self) -> String {
        format!("{}/{}", self.network, self.prefix_len)
    }

    pub fn desktop_ip(&self) -> Ipv4Addr {
        high_host(self.network, self.prefix_len, PRIVILEGED_DESKTOP_OFFSET)
    }

    pub fn sandbox_ip(&self) -> Ipv4Addr {
        high_host(self.network, self.prefix_len, PRIVILEGED_SANDBOX_OFFSET)
    }

    /// Veth names are keyed by PID, which is unique while the desktop runs
    pub fn veth_names(pid: u32) -> (String, String) {
        (
            format!("{}{}", PRIVILEGED_VETH_DESKTOP_PREFIX, pid),
            format!("{}{}", PRIVILEGED_VETH_SANDBOX_PREFIX, pid),
        )
    }

    fn masquerade_rule(&self, sandbox_veth: &str) -> NatRule {
        NatRule::new(
            "POSTROUTING",
            vec![
                "-s".to_string(),
                self.desktop_ip().to_string(),
                "!".to_string(),
                "-o".to_string(),
                sandbox_veth.to_string(),
                "-j".to_string(),
                "MASQUERADE".to_string(),
            ],
        )
    }

    /// Where published ports of the shared runtime are reachable from the desktop
    pub async fn runtime_gateway(&self) -> Ipv4Addr {
        match self.net.default_gateway().await {
            Ok(Some(gw)) => gw,
            Ok(None) => Ipv4Addr::from(u32::from(self.network) + 1),
            Err(e) => {
                tracing::warn!("Could not read default route, using first subnet host: {}", e);
                Ipv4Addr::from(u32::from(self.network) + 1)
            }
        }
    }

    pub async fn attach(&self, pid: u32) -> BridgerResult<PrivilegedLink> {
        let (desktop_end, sandbox_end) = Self::veth_names(pid);

        for name in [&desktop_end, &sandbox_end] {
            if let Err(e) = self.net.delete_interface(name).await {
                tracing::warn!(interface = %name, "Orphan cleanup failed: {}", e);
            }
        }

        self.net
            .create_veth_pair(&desktop_end, &sandbox_end)
            .await
            .map_err(|e| BridgerError::kernel(format!("create veth pair {}/{}", desktop_end, sandbox_end), e))?;

        match self.configure(pid, &desktop_end, &sandbox_end).await {
            Ok(attachment) => {
                tracing::info!(
                    pid,
                    desktop_ip = %attachment.desktop_ip,
                    gateway = %attachment.gateway,
                    subnet = %self.subnet(),
                    "Desktop bridged to shared runtime network (privileged mode)"
                );
                Ok(PrivilegedLink {
                    pid,
                    sandbox_veth: sandbox_end,
                    attachment,
                })
            }
            Err(e) => {
                if let Err(cleanup) = self.net.delete_interface(&sandbox_end).await {
                    tracing::warn!(interface = %sandbox_end, "Rollback failed: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    async fn configure(&self, pid: u32, desktop_end: &str, sandbox_end: &str) -> BridgerResult<BridgeAttachment> {
        let ns = Namespace::Process(pid);
        let sandbox_ip = self.sandbox_ip();
        let desktop_ip = self.desktop_ip();

        self.net
            .assign_address(Namespace::Host, sandbox_end, sandbox_ip, self.prefix_len)
            .await
            .map_err(|e| BridgerError::kernel(format!("assign {} to {}", sandbox_ip, sandbox_end), e))?;
        self.net
            .set_link_up(Namespace::Host, sandbox_end)
            .await
            .map_err(|e| BridgerError::kernel(format!("set {} up", sandbox_end), e))?;

        self.net
            .move_to_namespace(desktop_end, pid)
            .await
            .map_err(|e| BridgerError::kernel(format!("move {} to netns of pid {}", desktop_end, pid), e))?;
        self.net
            .rename_interface(ns, desktop_end, DESKTOP_INTERFACE)
            .await
            .map_err(|e| BridgerError::kernel(format!("rename {} to {} in {}", desktop_end, DESKTOP_INTERFACE, ns), e))?;
        self.net
            .assign_address(ns, DESKTOP_INTERFACE, desktop_ip, 32)
            .await
            .map_err(|e| BridgerError::kernel(format!("assign {}/32 in {}", desktop_ip, ns), e))?;
        self.net
            .set_link_up(ns, DESKTOP_INTERFACE)
            .await
            .map_err(|e| BridgerError::kernel(format!("set {} up in {}", DESKTOP_INTERFACE, ns), e))?;

        let routes = [
            Route {
                destination: sandbox_ip,
                prefix_len: 32,
                via: None,
                device: Some(DESKTOP_INTERFACE.to_string()),
            },
            Route {
                destination: self.network,
                prefix_len: self.prefix_len,
                via: Some(sandbox_ip),
                device: Some(DESKTOP_INTERFACE.to_string()),
            },
        ];
        for route in &routes {
            match self.net.add_route(ns, route).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {
                    tracing::warn!(route = %route, "Route already present in desktop");
                }
                Err(e) => return Err(BridgerError::kernel(format!("add route {} in {}", route, ns), e)),
            }
        }

        self.net
            .set_sysctl(Namespace::Host, "net.ipv4.ip_forward", "1")
            .await
            .map_err(|e| BridgerError::kernel("enable ip_forward", e))?;

        if let Err(e) = self
            .net
            .install_nat_rule(Namespace::Host, &self.masquerade_rule(sandbox_end))
            .await
        {
            tracing::warn!(pid, "Failed to install desktop masquerade: {}", e);
        }

        Ok(BridgeAttachment {
            desktop_ip,
            gateway: self.runtime_gateway().await,
            interface: DESKTOP_INTERFACE.to_string(),
        })
    }

    /// Remove a privileged bridge; tolerant of a desktop that is already gone
    pub async fn detach(&self, link: &PrivilegedLink) {
        if let Err(e) = self
            .net
            .remove_nat_rule(Namespace::Host, &self.masquerade_rule(&link.sandbox_veth))
            .await
        {
            tracing::warn!(pid = link.pid, "Failed to remove desktop masquerade: {}", e);
        }
        if let Err(e) = self.net.delete_interface(&link.sandbox_veth).await {
            tracing::warn!(interface = %link.sandbox_veth, "Failed to delete privileged veth: {}", e);
        }
    }
}
