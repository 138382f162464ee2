//! Naming and addressing constants for tenant networks.
//!
//! The interface names below are read back by the recovery scan after a
//! restart, so they are part of the on-host contract and must not change.

// ============================================================================
// Interface naming
// ============================================================================

/// Tenant bridge: `hydra{index}`
pub const BRIDGE_PREFIX: &str = "hydra";

/// Desktop-side end of a tenant veth pair: `vethd-h{index}`
pub const VETH_DESKTOP_PREFIX: &str = "vethd-h";

/// Bridge-side end of a tenant veth pair: `vethb-h{index}`
pub const VETH_BRIDGE_PREFIX: &str = "vethb-h";

/// Privileged mode pair, keyed by desktop PID: `vethd-p{pid}` / `veths-p{pid}`
pub const PRIVILEGED_VETH_DESKTOP_PREFIX: &str = "vethd-p";
pub const PRIVILEGED_VETH_SANDBOX_PREFIX: &str = "veths-p";

/// Name the desktop-side veth takes inside the desktop namespace (eth0 is the runtime's)
pub const DESKTOP_INTERFACE: &str = "eth1";

/// Kernel limit (IFNAMSIZ - 1)
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

// ============================================================================
// Addressing
// ============================================================================

pub const MIN_BRIDGE_INDEX: u8 = 1;
pub const MAX_BRIDGE_INDEX: u8 = 254;

/// Tenant subnets are `10.200.{index}.0/24`
pub const TENANT_NET_OCTETS: [u8; 2] = [10, 200];
pub const TENANT_PREFIX_LEN: u8 = 24;
pub const GATEWAY_HOST_OCTET: u8 = 1;
pub const DESKTOP_HOST_OCTET: u8 = 254;

/// Reserved addresses at the top of the shared runtime subnet (privileged mode),
/// counted down from the broadcast address
pub const PRIVILEGED_DESKTOP_OFFSET: u32 = 1;
pub const PRIVILEGED_SANDBOX_OFFSET: u32 = 2;

// ============================================================================
// Paths and endpoints
// ============================================================================

pub const DEFAULT_API_SOCKET: &str = "/var/run/hydra/hydra.sock";
pub const DEFAULT_SOCKET_DIR: &str = "/var/run/hydra/active";
/// Must be a real volume: overlay2 cannot stack on an overlay filesystem.
pub const DEFAULT_DATA_DIR: &str = "/hydra-data";
pub const DEFAULT_DESKTOP_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";
pub const SYSTEMD_RESOLVED_UPSTREAM_CONF: &str = "/run/systemd/resolve/resolv.conf";
pub const DEFAULT_PRIVILEGED_SUBNET: &str = "172.17.0.0/16";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
