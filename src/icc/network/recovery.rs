// Startup reconciliation of tenant bridges and veth leftovers

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::icc::network::error::NetworkResult;
use crate::icc::network::operator::NetworkOperator;
use crate::sync::ipam::{parse_index_suffix, BridgeIndexPool};
use crate::utils::constants::{
    BRIDGE_PREFIX, PRIVILEGED_VETH_DESKTOP_PREFIX, VETH_BRIDGE_PREFIX, VETH_DESKTOP_PREFIX,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Indices of live `hydraN` bridges, now reserved in the pool
    pub bridges: Vec<u8>,
    pub removed: Vec<String>,
}

pub struct BridgeScanner {
    net: Arc<dyn NetworkOperator>,
}

impl BridgeScanner {
    pub fn new(net: Arc<dyn NetworkOperator>) -> Self {
        Self { net }
    }

    /// Bridge indices currently present in the kernel, ascending
    pub async fn live_bridges(&self) -> NetworkResult<Vec<u8>> {
        let names = self.net.list_interfaces(BRIDGE_PREFIX).await?;
        let indices: BTreeSet<u8> = names
            .iter()
            .filter_map(|n| parse_index_suffix(n, BRIDGE_PREFIX))
            .collect();
        Ok(indices.into_iter().collect())
    }

    /// Reserve every live bridge index in `pool`, then delete veth ends that
    /// can never be reattached. Must run before the first allocation.
    pub async fn recover(&self, pool: &BridgeIndexPool) -> NetworkResult<RecoveryReport> {
        let bridges = self.live_bridges().await?;
        for index in &bridges {
            pool.mark_used(*index);
        }

        let mut removed = Vec::new();
        for prefix in [VETH_BRIDGE_PREFIX, VETH_DESKTOP_PREFIX] {
            for name in self.net.list_interfaces(prefix).await? {
                let orphaned = match parse_index_suffix(&name, prefix) {
                    Some(index) => !bridges.contains(&index),
                    None => false,
                };
                if orphaned {
                    self.remove_orphan(&name, &mut removed).await;
                }
            }
        }

        // A privileged desktop end still in our namespace was never moved
        for name in self.net.list_interfaces(PRIVILEGED_VETH_DESKTOP_PREFIX).await? {
            self.remove_orphan(&name, &mut removed).await;
        }

        tracing::info!(
            bridges = ?bridges,
            removed = removed.len(),
            "Recovered tenant bridge state from kernel"
        );
        Ok(RecoveryReport { bridges, removed })
    }

    async fn remove_orphan(&self, name: &str, removed: &mut Vec<String>) {
        tracing::warn!(interface = name, "Orphaned veth detected");
        match self.net.delete_interface(name).await {
            Ok(()) => removed.push(name.to_string()),
            Err(e) => tracing::warn!(interface = name, "Failed to clean up orphaned veth: {}", e),
        }
    }
}
