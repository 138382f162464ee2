use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::icc::network::error::{NetworkError, NetworkResult};
use crate::icc::network::netlink::NetlinkHandle;
use crate::utils::command::{CommandExecutor, CommandResult};

/// Which network stack an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// The bridger's own namespace
    Host,
    /// The namespace of a running process (the desktop container's init)
    Process(u32),
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Namespace::Host => write!(f, "host"),
            Namespace::Process(pid) => write!(f, "netns:{}", pid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub destination: Ipv4Addr,
    pub prefix_len: u8,
    pub via: Option<Ipv4Addr>,
    pub device: Option<String>,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.destination, self.prefix_len)?;
        if let Some(via) = self.via {
            write!(f, " via {}", via)?;
        }
        if let Some(dev) = &self.device {
            write!(f, " dev {}", dev)?;
        }
        Ok(())
    }
}

/// An iptables rule in the `nat` table: chain plus match/target arguments.
///
/// Two rules are the same rule when chain and arguments are equal, which is
/// also how iptables `-D` matches them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NatRule {
    pub chain: String,
    pub args: Vec<String>,
}

impl NatRule {
    pub fn new<S: Into<String>>(chain: &str, args: impl IntoIterator<Item = S>) -> Self {
        Self {
            chain: chain.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn command_args(&self, action: &str) -> Vec<String> {
        let mut v = vec![
            "-t".to_string(),
            "nat".to_string(),
            action.to_string(),
            self.chain.clone(),
        ];
        v.extend(self.args.iter().cloned());
        v
    }
}

impl std::fmt::Display for NatRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "-t nat {} {}", self.chain, self.args.join(" "))
    }
}

/// Kernel mutations the bridging algorithms need.
///
/// Interface-level calls without a [`Namespace`] act on the host namespace.
/// Deletions are idempotent: a missing object is success.
#[async_trait]
pub trait NetworkOperator: Send + Sync {
    /// Create a bridge, assign `gateway/prefix_len` and bring it up
    async fn create_bridge(&self, name: &str, gateway: Ipv4Addr, prefix_len: u8) -> NetworkResult<()>;

    async fn delete_interface(&self, name: &str) -> NetworkResult<()>;

    async fn delete_namespace_interface(&self, ns: Namespace, name: &str) -> NetworkResult<()>;

    async fn list_interfaces(&self, prefix: &str) -> NetworkResult<Vec<String>>;

    async fn create_veth_pair(&self, name: &str, peer: &str) -> NetworkResult<()>;

    /// Enslave `iface` to `bridge` and bring it up
    async fn attach_to_bridge(&self, iface: &str, bridge: &str) -> NetworkResult<()>;

    async fn move_to_namespace(&self, iface: &str, pid: u32) -> NetworkResult<()>;

    async fn rename_interface(&self, ns: Namespace, name: &str, new_name: &str) -> NetworkResult<()>;

    async fn assign_address(&self, ns: Namespace, iface: &str, addr: Ipv4Addr, prefix_len: u8) -> NetworkResult<()>;

    async fn set_link_up(&self, ns: Namespace, iface: &str) -> NetworkResult<()>;

    /// Returns the raw error on EEXIST so callers decide whether that is fine
    async fn add_route(&self, ns: Namespace, route: &Route) -> NetworkResult<()>;

    /// Remove every identical rule, then append one
    async fn install_nat_rule(&self, ns: Namespace, rule: &NatRule) -> NetworkResult<()>;

    async fn remove_nat_rule(&self, ns: Namespace, rule: &NatRule) -> NetworkResult<()>;

    async fn set_sysctl(&self, ns: Namespace, key: &str, value: &str) -> NetworkResult<()>;

    /// Drop new connections routed into `bridge` from any other interface.
    /// The rule lives in DOCKER-USER, which FORWARD consults before the
    /// accept rules each daemon adds for its own bridge.
    async fn install_isolation(&self, bridge: &str) -> NetworkResult<()>;

    async fn remove_isolation(&self, bridge: &str) -> NetworkResult<()>;

    /// Host default route gateway
    async fn default_gateway(&self) -> NetworkResult<Option<Ipv4Addr>>;
}

/// Upper bound on `-D` repetitions when flushing duplicates of one rule
const MAX_DUPLICATE_RULES: usize = 32;
/// Filter chain dockerd keeps at the top of FORWARD and never flushes
pub const USER_CHAIN: &str = "DOCKER-USER";

/// Real implementation: rtnetlink for links/addresses/routes, iptables and
/// sysctl (through nsenter for other namespaces) for the rest.
pub struct LinuxNetworkOperator {
    nl: NetlinkHandle,
}

impl LinuxNetworkOperator {
    pub fn new() -> NetworkResult<Self> {
        Ok(Self {
            nl: NetlinkHandle::new()?,
        })
    }

    async fn run_tool(ns: Namespace, program: &str, args: &[String]) -> NetworkResult<CommandResult> {
        let result = match ns {
            Namespace::Host => CommandExecutor::execute(program, args).await?,
            Namespace::Process(pid) => CommandExecutor::execute_in_netns(pid, program, args).await?,
        };
        Ok(result)
    }

    async fn run_checked(ns: Namespace, program: &str, args: &[String]) -> NetworkResult<()> {
        let result = Self::run_tool(ns, program, args).await?;
        if result.success {
            Ok(())
        } else {
            Err(NetworkError::Command {
                cmd: format!("[{}] {}", ns, CommandExecutor::render(program, args)),
                stderr: result.stderr,
            })
        }
    }

    /// `-D` until iptables reports no match
    async fn delete_all(ns: Namespace, args: Vec<String>) -> NetworkResult<usize> {
        let mut removed = 0;
        for _ in 0..MAX_DUPLICATE_RULES {
            let result = Self::run_tool(ns, "iptables", &args).await?;
            if !result.success {
                break;
            }
            removed += 1;
        }
        Ok(removed)
    }

    fn isolation_args(action: &str, bridge: &str) -> Vec<String> {
        strings(&[
            action, USER_CHAIN, "-o", bridge, "!", "-i", bridge, "-m", "conntrack", "--ctstate",
            "NEW", "-j", "DROP",
        ])
    }

    /// Create DOCKER-USER and the FORWARD jump when no daemon has done so yet
    async fn ensure_user_chain() -> NetworkResult<()> {
        let listed = Self::run_tool(Namespace::Host, "iptables", &strings(&["-n", "-L", USER_CHAIN])).await?;
        if !listed.success {
            Self::run_checked(Namespace::Host, "iptables", &strings(&["-N", USER_CHAIN])).await?;
        }
        let jump = Self::run_tool(Namespace::Host, "iptables", &strings(&["-C", "FORWARD", "-j", USER_CHAIN])).await?;
        if !jump.success {
            Self::run_checked(Namespace::Host, "iptables", &strings(&["-I", "FORWARD", "-j", USER_CHAIN])).await?;
        }
        Ok(())
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl NetworkOperator for LinuxNetworkOperator {
    async fn create_bridge(&self, name: &str, gateway: Ipv4Addr, prefix_len: u8) -> NetworkResult<()> {
        self.nl.create_bridge(name).await?;
        self.nl.add_address(name, gateway, prefix_len).await?;
        self.nl.set_link_up(name).await
    }

    async fn delete_interface(&self, name: &str) -> NetworkResult<()> {
        self.nl.delete_link(name).await
    }

    async fn delete_namespace_interface(&self, ns: Namespace, name: &str) -> NetworkResult<()> {
        match ns {
            Namespace::Host => self.nl.delete_link(name).await,
            Namespace::Process(pid) => {
                let name = name.to_string();
                NetlinkHandle::run_in_netns(pid, move |nl| async move { nl.delete_link(&name).await })
                    .await
            }
        }
    }

    async fn list_interfaces(&self, prefix: &str) -> NetworkResult<Vec<String>> {
        self.nl.list_links_with_prefix(prefix).await
    }

    async fn create_veth_pair(&self, name: &str, peer: &str) -> NetworkResult<()> {
        self.nl.create_veth_pair(name, peer).await
    }

    async fn attach_to_bridge(&self, iface: &str, bridge: &str) -> NetworkResult<()> {
        self.nl.set_link_master(iface, bridge).await?;
        self.nl.set_link_up(iface).await
    }

    async fn move_to_namespace(&self, iface: &str, pid: u32) -> NetworkResult<()> {
        self.nl.set_link_netns_by_pid(iface, pid).await
    }

    async fn rename_interface(&self, ns: Namespace, name: &str, new_name: &str) -> NetworkResult<()> {
        match ns {
            Namespace::Host => self.nl.rename_link(name, new_name).await,
            Namespace::Process(pid) => {
                let (name, new_name) = (name.to_string(), new_name.to_string());
                NetlinkHandle::run_in_netns(pid, move |nl| async move {
                    nl.rename_link(&name, &new_name).await
                })
                .await
            }
        }
    }

    async fn assign_address(&self, ns: Namespace, iface: &str, addr: Ipv4Addr, prefix_len: u8) -> NetworkResult<()> {
        match ns {
            Namespace::Host => self.nl.add_address(iface, addr, prefix_len).await,
            Namespace::Process(pid) => {
                let iface = iface.to_string();
                NetlinkHandle::run_in_netns(pid, move |nl| async move {
                    nl.add_address(&iface, addr, prefix_len).await
                })
                .await
            }
        }
    }

    async fn set_link_up(&self, ns: Namespace, iface: &str) -> NetworkResult<()> {
        match ns {
            Namespace::Host => self.nl.set_link_up(iface).await,
            Namespace::Process(pid) => {
                let iface = iface.to_string();
                NetlinkHandle::run_in_netns(pid, move |nl| async move { nl.set_link_up(&iface).await })
                    .await
            }
        }
    }

    async fn add_route(&self, ns: Namespace, route: &Route) -> NetworkResult<()> {
        match ns {
            Namespace::Host => {
                self.nl
                    .add_route(route.destination, route.prefix_len, route.via, route.device.as_deref())
                    .await
            }
            Namespace::Process(pid) => {
                let route = route.clone();
                NetlinkHandle::run_in_netns(pid, move |nl| async move {
                    nl.add_route(route.destination, route.prefix_len, route.via, route.device.as_deref())
                        .await
                })
                .await
            }
        }
    }

    async fn install_nat_rule(&self, ns: Namespace, rule: &NatRule) -> NetworkResult<()> {
        let removed = Self::delete_all(ns, rule.command_args("-D")).await?;
        if removed > 0 {
            tracing::debug!(namespace = %ns, rule = %rule, removed, "Replaced existing NAT rule");
        }
        Self::run_checked(ns, "iptables", &rule.command_args("-A")).await
    }

    async fn remove_nat_rule(&self, ns: Namespace, rule: &NatRule) -> NetworkResult<()> {
        Self::delete_all(ns, rule.command_args("-D")).await.map(|_| ())
    }

    async fn set_sysctl(&self, ns: Namespace, key: &str, value: &str) -> NetworkResult<()> {
        let args = vec!["-w".to_string(), format!("{}={}", key, value)];
        Self::run_checked(ns, "sysctl", &args).await
    }

    async fn install_isolation(&self, bridge: &str) -> NetworkResult<()> {
        Self::ensure_user_chain().await?;
        Self::delete_all(Namespace::Host, Self::isolation_args("-D", bridge)).await?;
        Self::run_checked(Namespace::Host, "iptables", &Self::isolation_args("-I", bridge)).await
    }

    async fn remove_isolation(&self, bridge: &str) -> NetworkResult<()> {
        Self::delete_all(Namespace::Host, Self::isolation_args("-D", bridge))
            .await
            .map(|_| ())
    }

    async fn default_gateway(&self) -> NetworkResult<Option<Ipv4Addr>> {
        self.nl.default_gateway().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nat_rule_renders_iptables_arguments() {
        let rule = NatRule::new(
            "OUTPUT",
            ["-o", "lo", "-d", "127.0.0.1", "-p", "tcp", "--dport", "8080", "-j", "DNAT",
             "--to-destination", "10.200.1.1:8080"],
        );
        let args = rule.command_args("-A");
        assert_eq!(&args[..4], &["-t", "nat", "-A", "OUTPUT"]);
        assert_eq!(args.last().map(String::as_str), Some("10.200.1.1:8080"));
        assert_eq!(
            rule.to_string(),
            "-t nat OUTPUT -o lo -d 127.0.0.1 -p tcp --dport 8080 -j DNAT --to-destination 10.200.1.1:8080"
        );
    }

    #[test]
    fn isolation_rule_targets_bridge() {
        let args = LinuxNetworkOperator::isolation_args("-I", "hydra3");
        assert_eq!(args.join(" "), "-I DOCKER-USER -o hydra3 ! -i hydra3 -m conntrack --ctstate NEW -j DROP");
    }

    #[test]
    fn route_display() {
        let route = Route {
            destination: Ipv4Addr::new(10, 200, 3, 0),
            prefix_len: 24,
            via: Some(Ipv4Addr::new(10, 200, 3, 1)),
            device: Some("eth1".into()),
        };
        assert_eq!(route.to_string(), "10.200.3.0/24 via 10.200.3.1 dev eth1");
    }
}
