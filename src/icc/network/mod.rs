// Network plumbing: netlink and iptables behind NetworkOperator, and the
// bridging algorithms built on top of it.

pub mod dns_manager;
pub mod error;
pub mod netlink;
pub mod operator;
pub mod port_mapping;
pub mod privileged;
pub mod recovery;
pub mod veth;

#[cfg(test)]
pub mod testing;

pub use dns_manager::{DnsHandle, DnsManager, DnsState};
pub use error::{NetworkError, NetworkResult};
pub use operator::{LinuxNetworkOperator, Namespace, NetworkOperator};
pub use port_mapping::{PortForwarder, PortMapping, Protocol};
pub use privileged::{PrivilegedBridger, PrivilegedLink};
pub use recovery::{BridgeScanner, RecoveryReport};
pub use veth::{BridgeAttachment, VethBridger};
