// In-memory registry of tenant network instances with per-scope serialization

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::daemon::provisioner::{DaemonHandle, RuntimeDirs};
use crate::icc::network::dns_manager::DnsHandle;
use crate::icc::network::port_mapping::PortMapping;
use crate::icc::network::veth::BridgeAttachment;
use crate::sync::ipam::TenantAddressing;

/// The desktop currently connected to a scope's bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopBinding {
    pub container_id: String,
    /// Liveness fingerprint: a different PID means the container was recreated
    pub pid: u32,
    pub veth_bridge_name: String,
    pub attachment: BridgeAttachment,
    pub forwarded_ports: Vec<PortMapping>,
}

pub struct TenantNetworkInstance {
    pub scope_id: String,
    pub addressing: TenantAddressing,
    pub dirs: RuntimeDirs,
    pub daemon: DaemonHandle,
    pub dns: DnsHandle,
    pub desktop: Option<DesktopBinding>,
    /// When this bridger started or adopted the daemon
    pub started_at: Instant,
}

impl TenantNetworkInstance {
    pub fn desktop_bridged(&self) -> bool {
        self.desktop.is_some()
    }

    pub fn docker_host(&self) -> String {
        self.dirs.docker_host()
    }

    pub fn socket_path(&self) -> String {
        self.dirs.socket.display().to_string()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

type Slot = Arc<Mutex<Option<TenantNetworkInstance>>>;

/// Exclusive access to one scope's slot. Holding it serializes every
/// read-modify-write on that scope; other scopes are unaffected.
pub struct ScopeGuard {
    slot: OwnedMutexGuard<Option<TenantNetworkInstance>>,
    live: Arc<AtomicUsize>,
}

impl ScopeGuard {
    pub fn get(&self) -> Option<&TenantNetworkInstance> {
        self.slot.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut TenantNetworkInstance> {
        self.slot.as_mut()
    }

    pub fn insert(&mut self, instance: TenantNetworkInstance) {
        if self.slot.replace(instance).is_none() {
            self.live.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn take(&mut self) -> Option<TenantNetworkInstance> {
        let taken = self.slot.take();
        if taken.is_some() {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        taken
    }
}

type DesktopLocks = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Held while one desktop is being bridged. The lock entry is dropped with
/// its last holder.
pub struct DesktopGuard {
    guard: Option<OwnedMutexGuard<()>>,
    container_id: String,
    locks: DesktopLocks,
}

impl Drop for DesktopGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.container_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[derive(Default)]
pub struct ScopeRegistry {
    slots: DashMap<String, Slot>,
    desktops: DesktopLocks,
    /// desktop container id -> scope it is bridged to
    owners: DashMap<String, String>,
    live: Arc<AtomicUsize>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock a scope's slot, creating an empty one if needed.
    /// The map guard is released before waiting on the scope lock.
    pub async fn lock(&self, scope_id: &str) -> ScopeGuard {
        let slot = self
            .slots
            .entry(scope_id.to_string())
            .or_insert_with(Default::default)
            .value()
            .clone();
        ScopeGuard {
            slot: slot.lock_owned().await,
            live: self.live.clone(),
        }
    }

    /// Lock a scope only if it has ever been created
    pub async fn lock_existing(&self, scope_id: &str) -> Option<ScopeGuard> {
        let slot = self.slots.get(scope_id).map(|s| s.value().clone())?;
        Some(ScopeGuard {
            slot: slot.lock_owned().await,
            live: self.live.clone(),
        })
    }

    /// Serializes bridging of one desktop container across scopes
    pub async fn lock_desktop(&self, container_id: &str) -> DesktopGuard {
        let lock = self
            .desktops
            .entry(container_id.to_string())
            .or_insert_with(Default::default)
            .value()
            .clone();
        DesktopGuard {
            guard: Some(lock.lock_owned().await),
            container_id: container_id.to_string(),
            locks: self.desktops.clone(),
        }
    }

    pub fn scope_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Drop an empty slot nobody is waiting on
    pub fn prune(&self, scope_id: &str) {
        self.slots.remove_if(scope_id, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().map(|g| g.is_none()).unwrap_or(false)
        });
    }

    pub fn desktop_owner(&self, container_id: &str) -> Option<String> {
        self.owners.get(container_id).map(|o| o.value().clone())
    }

    pub fn set_desktop_owner(&self, container_id: &str, scope_id: &str) {
        self.owners.insert(container_id.to_string(), scope_id.to_string());
    }

    /// Forget ownership only if `scope_id` still holds it
    pub fn clear_desktop_owner(&self, container_id: &str, scope_id: &str) {
        self.owners.remove_if(container_id, |_, owner| owner == scope_id);
    }

    pub fn active_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    fn instance(scope: &str, index: u8) -> TenantNetworkInstance {
        TenantNetworkInstance {
            scope_id: scope.to_string(),
            addressing: TenantAddressing::new(index),
            dirs: RuntimeDirs::new(Path::new("/run/test"), Path::new("/data"), scope),
            daemon: DaemonHandle::monitored(None, |_, stop| async move {
                let _ = stop.await;
            }),
            dns: DnsHandle::disabled(),
            desktop: None,
            started_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn live_count_tracks_inserts_and_takes() {
        let registry = ScopeRegistry::new();
        {
            let mut guard = registry.lock("a").await;
            guard.insert(instance("a", 1));
            guard.insert(instance("a", 1));
        }
        assert_eq!(registry.active_count(), 1);

        let mut guard = registry.lock("a").await;
        assert!(guard.take().is_some());
        assert!(guard.take().is_none());
        drop(guard);
        assert_eq!(registry.active_count(), 0);

        registry.prune("a");
        assert!(registry.scope_ids().is_empty());
        assert!(registry.lock_existing("a").await.is_none());
    }

    #[tokio::test]
    async fn same_scope_is_serialized_other_scopes_are_not() {
        let registry = Arc::new(ScopeRegistry::new());
        let held = registry.lock("a").await;

        let other = tokio::time::timeout(Duration::from_millis(100), registry.lock("b")).await;
        assert!(other.is_ok());

        let r = registry.clone();
        let waiter = tokio::spawn(async move {
            let _g = r.lock("a").await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(held);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn desktop_locks_do_not_outlive_their_holders() {
        let registry = Arc::new(ScopeRegistry::new());
        drop(registry.lock_desktop("d1").await);
        assert!(registry.desktops.is_empty());

        let held = registry.lock_desktop("d2").await;
        let r = registry.clone();
        let waiter = tokio::spawn(async move {
            let _g = r.lock_desktop("d2").await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
        assert_eq!(registry.desktops.len(), 1);
        waiter.await.unwrap();
        assert!(registry.desktops.is_empty());
    }

    #[test]
    fn owner_is_cleared_only_by_its_scope() {
        let registry = ScopeRegistry::new();
        registry.set_desktop_owner("d1", "s2");
        registry.clear_desktop_owner("d1", "s1");
        assert_eq!(registry.desktop_owner("d1").as_deref(), Some("s2"));
        registry.clear_desktop_owner("d1", "s2");
        assert_eq!(registry.desktop_owner("d1"), None);
    }
}
