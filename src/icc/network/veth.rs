// Veth bridging between the shared desktop namespace and a tenant bridge

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::Serialize;

use crate::icc::network::operator::{Namespace, NetworkOperator, Route};
use crate::sync::error::{BridgerError, BridgerResult};
use crate::sync::ipam::TenantAddressing;
use crate::utils::constants::DESKTOP_INTERFACE;

/// What the desktop sees after bridging
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeAttachment {
    pub desktop_ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub interface: String,
}

pub struct VethBridger {
    net: Arc<dyn NetworkOperator>,
}

impl VethBridger {
    pub fn new(net: Arc<dyn NetworkOperator>) -> Self {
        Self { net }
    }

    /// Best-effort removal of a bridge-side veth. Deleting either end of a
    /// pair takes the peer with it, so this also drops the desktop's `eth1`
    /// if its namespace is still alive.
    pub async fn remove_bridge_side(&self, veth_bridge: &str) -> bool {
        match self.net.delete_interface(veth_bridge).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(interface = veth_bridge, "Failed to delete stale veth: {}", e);
                false
            }
        }
    }

    /// Connect the namespace of `pid` to the tenant bridge of `addressing`.
    ///
    /// Leaves nothing behind on failure: once the pair exists, any later
    /// error deletes the bridge-side end before returning.
    pub async fn attach(&self, addressing: &TenantAddressing, pid: u32) -> BridgerResult<BridgeAttachment> {
        let desktop_end = addressing.veth_desktop_name();
        let bridge_end = addressing.veth_bridge_name();
        let bridge = addressing.bridge_name();

        self.clear_leftovers(&desktop_end, &bridge_end, pid).await;

        self.net
            .create_veth_pair(&desktop_end, &bridge_end)
            .await
            .map_err(|e| {
                BridgerError::kernel(format!("create veth pair {}/{}", desktop_end, bridge_end), e)
            })?;

        match self.configure(addressing, pid, &desktop_end, &bridge_end, &bridge).await {
            Ok(attachment) => {
                tracing::info!(
                    bridge = %bridge,
                    veth = %bridge_end,
                    pid,
                    desktop_ip = %attachment.desktop_ip,
                    "Desktop bridged"
                );
                Ok(attachment)
            }
            Err(e) => {
                tracing::warn!(veth = %bridge_end, "Bridging failed, rolling back: {}", e);
                self.remove_bridge_side(&bridge_end).await;
                Err(e)
            }
        }
    }

    /// Interrupted earlier attempts can leave either end in the host namespace,
    /// and a desktop that survived a bridger restart may still carry an `eth1`.
    async fn clear_leftovers(&self, desktop_end: &str, bridge_end: &str, pid: u32) {
        for name in [desktop_end, bridge_end] {
            if let Err(e) = self.net.delete_interface(name).await {
                tracing::warn!(interface = name, "Orphan cleanup failed: {}", e);
            }
        }
        if let Err(e) = self
            .net
            .delete_namespace_interface(Namespace::Process(pid), DESKTOP_INTERFACE)
            .await
        {
            tracing::warn!(pid, interface = DESKTOP_INTERFACE, "Orphan cleanup in desktop failed: {}", e);
        }
    }

    async fn configure(
        &self,
        addressing: &TenantAddressing,
        pid: u32,
        desktop_end: &str,
        bridge_end: &str,
        bridge: &str,
    ) -> BridgerResult<BridgeAttachment> {
        let ns = Namespace::Process(pid);

        self.net
            .attach_to_bridge(bridge_end, bridge)
            .await
            .map_err(|e| BridgerError::kernel(format!("attach {} to {}", bridge_end, bridge), e))?;

        self.net
            .move_to_namespace(desktop_end, pid)
            .await
            .map_err(|e| BridgerError::kernel(format!("move {} to netns of pid {}", desktop_end, pid), e))?;

        self.net
            .rename_interface(ns, desktop_end, DESKTOP_INTERFACE)
            .await
            .map_err(|e| {
                BridgerError::kernel(format!("rename {} to {} in {}", desktop_end, DESKTOP_INTERFACE, ns), e)
            })?;

        let desktop_ip = addressing.desktop_ip();
        self.net
            .assign_address(ns, DESKTOP_INTERFACE, desktop_ip, addressing.prefix_len())
            .await
            .map_err(|e| {
                BridgerError::kernel(
                    format!("assign {}/{} to {} in {}", desktop_ip, addressing.prefix_len(), DESKTOP_INTERFACE, ns),
                    e,
                )
            })?;

        self.net
            .set_link_up(ns, DESKTOP_INTERFACE)
            .await
            .map_err(|e| BridgerError::kernel(format!("set {} up in {}", DESKTOP_INTERFACE, ns), e))?;

        let route = Route {
            destination: addressing.network(),
            prefix_len: addressing.prefix_len(),
            via: None,
            device: Some(DESKTOP_INTERFACE.to_string()),
        };
        match self.net.add_route(ns, &route).await {
            Ok(()) => {}
            // The address assignment normally creates this connected route already
            Err(e) if e.is_already_exists() => {
                tracing::debug!(route = %route, "Tenant route already present");
            }
            Err(e) => return Err(BridgerError::kernel(format!("add route {} in {}", route, ns), e)),
        }

        Ok(BridgeAttachment {
            desktop_ip,
            gateway: addressing.gateway(),
            interface: DESKTOP_INTERFACE.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icc::network::testing::{FakeNetworkOperator, LinkKind, Mutation};

    fn setup(index: u8, pid: u32) -> (Arc<FakeNetworkOperator>, VethBridger, TenantAddressing) {
        let fake = Arc::new(FakeNetworkOperator::new());
        let addressing = TenantAddressing::new(index);
        fake.seed_link(&addressing.bridge_name(), LinkKind::Bridge);
        fake.spawn_namespace(pid);
        let bridger = VethBridger::new(fake.clone());
        (fake, bridger, addressing)
    }

    #[tokio::test]
    async fn attach_wires_both_ends() {
        let (fake, bridger, addressing) = setup(1, 4242);

        let attachment = bridger.attach(&addressing, 4242).await.unwrap();
        assert_eq!(attachment.desktop_ip, Ipv4Addr::new(10, 200, 1, 254));
        assert_eq!(attachment.gateway, Ipv4Addr::new(10, 200, 1, 1));
        assert_eq!(attachment.interface, "eth1");

        assert_eq!(fake.master_of("vethb-h1").as_deref(), Some("hydra1"));
        assert!(fake.is_up(Namespace::Host, "vethb-h1"));
        assert!(!fake.has_link(Namespace::Host, "vethd-h1"));
        assert!(fake.has_link(Namespace::Process(4242), "eth1"));
        assert!(fake.is_up(Namespace::Process(4242), "eth1"));
        assert!(fake
            .mutations()
            .contains(&Mutation::AssignAddress(
                Namespace::Process(4242),
                "eth1".into(),
                Ipv4Addr::new(10, 200, 1, 254),
                24
            )));
    }

    #[tokio::test]
    async fn stale_names_are_cleared_first() {
        let (fake, bridger, addressing) = setup(2, 100);
        fake.seed_veth_pair("vethd-h2", "vethb-h2", Some("hydra2"));

        bridger.attach(&addressing, 100).await.unwrap();
        let host = fake.links(Namespace::Host);
        assert_eq!(host, vec!["hydra2".to_string(), "vethb-h2".to_string()]);
    }

    #[tokio::test]
    async fn failure_after_creation_rolls_back() {
        let (fake, bridger, addressing) = setup(3, 7);
        fake.fail("assign_address");

        let err = bridger.attach(&addressing, 7).await.unwrap_err();
        assert_eq!(err.kind(), "KernelOperationFailed");
        assert!(err.to_string().contains("assign 10.200.3.254/24"));
        assert!(!fake.has_link(Namespace::Host, "vethb-h3"));
        assert!(!fake.has_link(Namespace::Process(7), "eth1"));
    }

    #[tokio::test]
    async fn dead_namespace_is_reported() {
        let (fake, bridger, addressing) = setup(4, 55);
        fake.destroy_namespace(55);

        let err = bridger.attach(&addressing, 55).await.unwrap_err();
        assert!(err.to_string().contains("move vethd-h4"));
        assert_eq!(fake.links(Namespace::Host), vec!["hydra4".to_string()]);
    }
}
