// Shared scope state, bridge index pool, error taxonomy and readiness retry

pub mod error;
pub mod instances;
pub mod ipam;
pub mod retry;

pub use error::{BridgerError, BridgerResult};
pub use instances::{DesktopBinding, ScopeRegistry, TenantNetworkInstance};
pub use ipam::{BridgeIndexPool, TenantAddressing};
