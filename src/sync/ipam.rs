use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use parking_lot::Mutex;

use crate::sync::error::{BridgerError, BridgerResult};
use crate::utils::constants::{
    BRIDGE_PREFIX, DESKTOP_HOST_OCTET, GATEWAY_HOST_OCTET, MAX_BRIDGE_INDEX, MIN_BRIDGE_INDEX,
    TENANT_NET_OCTETS, TENANT_PREFIX_LEN, VETH_BRIDGE_PREFIX, VETH_DESKTOP_PREFIX,
};

/// Process-wide pool of tenant bridge indices in `[1, 254]`.
///
/// Allocation always returns the smallest free index. The pool is rebuilt
/// from live `hydraN` bridges at startup via [`BridgeIndexPool::mark_used`]
/// before the first allocation.
#[derive(Debug, Default)]
pub struct BridgeIndexPool {
    used: Mutex<BTreeSet<u8>>,
}

impl BridgeIndexPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity() -> usize {
        (MAX_BRIDGE_INDEX - MIN_BRIDGE_INDEX) as usize + 1
    }

    pub fn allocate(&self) -> BridgerResult<u8> {
        let mut used = self.used.lock();
        let index = (MIN_BRIDGE_INDEX..=MAX_BRIDGE_INDEX)
            .find(|i| !used.contains(i))
            .ok_or(BridgerError::ResourceExhausted {
                capacity: Self::capacity(),
            })?;
        used.insert(index);
        Ok(index)
    }

    /// Return an index to the pool. Releasing a free index is a no-op.
    pub fn release(&self, index: u8) {
        self.used.lock().remove(&index);
    }

    /// Reserve an index discovered on a live kernel bridge.
    ///
    /// Returns false if the index is outside the tenant range.
    pub fn mark_used(&self, index: u8) -> bool {
        if !(MIN_BRIDGE_INDEX..=MAX_BRIDGE_INDEX).contains(&index) {
            return false;
        }
        self.used.lock().insert(index);
        true
    }

    pub fn in_use(&self) -> Vec<u8> {
        self.used.lock().iter().copied().collect()
    }
}

/// Addresses and interface names derived from one bridge index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantAddressing {
    pub index: u8,
}

impl TenantAddressing {
    pub fn new(index: u8) -> Self {
        Self { index }
    }

    pub fn bridge_name(&self) -> String {
        format!("{}{}", BRIDGE_PREFIX, self.index)
    }

    pub fn veth_desktop_name(&self) -> String {
        format!("{}{}", VETH_DESKTOP_PREFIX, self.index)
    }

    pub fn veth_bridge_name(&self) -> String {
        format!("{}{}", VETH_BRIDGE_PREFIX, self.index)
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::new(TENANT_NET_OCTETS[0], TENANT_NET_OCTETS[1], self.index, 0)
    }

    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            TENANT_NET_OCTETS[0],
            TENANT_NET_OCTETS[1],
            self.index,
            GATEWAY_HOST_OCTET,
        )
    }

    pub fn desktop_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            TENANT_NET_OCTETS[0],
            TENANT_NET_OCTETS[1],
            self.index,
            DESKTOP_HOST_OCTET,
        )
    }

    pub fn prefix_len(&self) -> u8 {
        TENANT_PREFIX_LEN
    }

    pub fn subnet(&self) -> String {
        format!("{}/{}", self.network(), TENANT_PREFIX_LEN)
    }
}

/// Extract the index from an interface name like `hydra7` or `vethb-h7`.
///
/// Only plain decimal suffixes in the tenant range are accepted, so
/// `hydra07` or `hydra-x` never match.
pub fn parse_index_suffix(name: &str, prefix: &str) -> Option<u8> {
    let suffix = name.strip_prefix(prefix)?;
    if suffix.is_empty()
        || !suffix.chars().all(|c| c.is_ascii_digit())
        || (suffix.len() > 1 && suffix.starts_with('0'))
    {
        return None;
    }
    let index: u8 = suffix.parse().ok()?;
    (MIN_BRIDGE_INDEX..=MAX_BRIDGE_INDEX)
        .contains(&index)
        .then_some(index)
}

/// Parse an IPv4 CIDR into its base address and prefix length
pub fn parse_ipv4_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), String> {
    let (ip, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| format!("invalid CIDR: {}", cidr))?;
    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|e| format!("invalid IP in CIDR {}: {}", cidr, e))?;
    let prefix_len: u8 = prefix
        .parse()
        .map_err(|_| format!("invalid prefix length: {}", prefix))?;
    if prefix_len > 30 {
        return Err(format!("prefix /{} leaves no usable host range", prefix_len));
    }
    let mask = prefix_mask(prefix_len);
    Ok((Ipv4Addr::from(u32::from(ip) & mask), prefix_len))
}

pub fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        (!0u32) << (32 - prefix_len)
    }
}

/// Broadcast address minus `offset` (offset 1 is the last usable host)
pub fn high_host(base: Ipv4Addr, prefix_len: u8, offset: u32) -> Ipv4Addr {
    let broadcast = u32::from(base) | !prefix_mask(prefix_len);
    Ipv4Addr::from(broadcast - offset)
}
