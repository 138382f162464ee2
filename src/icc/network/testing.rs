//! In-memory `NetworkOperator` that models links, namespaces and NAT tables
//! closely enough to check bridging properties without root.
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::icc::network::error::{NetworkError, NetworkResult};
use crate::icc::network::operator::{Namespace, NatRule, NetworkOperator, Route, USER_CHAIN};
use crate::sync::ipam::prefix_mask;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    CreateBridge(String),
    DeleteInterface(String),
    DeleteNamespaceInterface(Namespace, String),
    CreateVeth(String, String),
    Attach(String, String),
    MoveToNamespace(String, u32),
    Rename(Namespace, String, String),
    AssignAddress(Namespace, String, Ipv4Addr, u8),
    LinkUp(Namespace, String),
    AddRoute(Namespace, Route),
    InstallNat(Namespace, NatRule),
    RemoveNat(Namespace, NatRule),
    Sysctl(Namespace, String, String),
    InstallIsolation(String),
    RemoveIsolation(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Veth,
}

/// Interface match of a filter rule; `negated` is iptables' `!`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceMatch {
    pub name: String,
    pub negated: bool,
}

impl IfaceMatch {
    fn matches(&self, iface: &str) -> bool {
        (self.name == iface) != self.negated
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    Return,
    Jump(String),
}

/// One rule of the host filter table, reduced to interface matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub in_iface: Option<IfaceMatch>,
    pub out_iface: Option<IfaceMatch>,
    pub verdict: Verdict,
}

impl FilterRule {
    fn isolation(bridge: &str) -> Self {
        Self {
            in_iface: Some(IfaceMatch { name: bridge.to_string(), negated: true }),
            out_iface: Some(IfaceMatch { name: bridge.to_string(), negated: false }),
            verdict: Verdict::Drop,
        }
    }

    fn jump(chain: &str) -> Self {
        Self {
            in_iface: None,
            out_iface: None,
            verdict: Verdict::Jump(chain.to_string()),
        }
    }

    fn matches(&self, in_iface: &str, out_iface: &str) -> bool {
        self.in_iface.as_ref().map_or(true, |m| m.matches(in_iface))
            && self.out_iface.as_ref().map_or(true, |m| m.matches(out_iface))
    }
}

#[derive(Debug, Clone)]
struct Link {
    id: u64,
    ns: Namespace,
    name: String,
    kind: LinkKind,
    peer: Option<u64>,
    master: Option<String>,
    up: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    links: Vec<Link>,
    alive: HashSet<u32>,
    routes: HashSet<(Namespace, Route)>,
    nat: HashMap<Namespace, Vec<NatRule>>,
    /// Host filter table chains in evaluation order
    filter: HashMap<String, Vec<FilterRule>>,
    sysctls: HashMap<(Namespace, String), String>,
    mutations: Vec<Mutation>,
    failing: HashSet<&'static str>,
    default_gateway: Option<Ipv4Addr>,
}

impl State {
    fn find(&self, ns: Namespace, name: &str) -> Option<usize> {
        self.links.iter().position(|l| l.ns == ns && l.name == name)
    }

    fn check_ns(&self, ns: Namespace) -> NetworkResult<()> {
        match ns {
            Namespace::Host => Ok(()),
            Namespace::Process(pid) if self.alive.contains(&pid) => Ok(()),
            Namespace::Process(pid) => Err(NetworkError::NotFound(format!(
                "network namespace of pid {}",
                pid
            ))),
        }
    }

    fn check_failing(&self, op: &'static str) -> NetworkResult<()> {
        if self.failing.contains(op) {
            Err(NetworkError::Command {
                cmd: op.to_string(),
                stderr: "injected failure".to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn remove_link(&mut self, idx: usize) {
        let link = self.links.remove(idx);
        if let Some(peer) = link.peer {
            self.links.retain(|l| l.id != peer);
        }
    }

    /// Create the user chain and a FORWARD jump to it if either is missing
    fn ensure_user_chain(&mut self) {
        self.filter.entry(USER_CHAIN.to_string()).or_default();
        let forward = self.filter.entry("FORWARD".to_string()).or_default();
        let jump = FilterRule::jump(USER_CHAIN);
        if !forward.contains(&jump) {
            forward.insert(0, jump);
        }
    }

    /// Keep the user chain and exactly one jump to it at the top of FORWARD
    fn arrange_user_chain(&mut self) {
        self.filter.entry(USER_CHAIN.to_string()).or_default();
        let forward = self.filter.entry("FORWARD".to_string()).or_default();
        let jump = FilterRule::jump(USER_CHAIN);
        forward.retain(|r| *r != jump);
        forward.insert(0, jump);
    }

    fn evaluate(&self, chain: &str, in_iface: &str, out_iface: &str, depth: usize) -> Option<Verdict> {
        if depth > 8 {
            return Some(Verdict::Drop);
        }
        for rule in self.filter.get(chain).into_iter().flatten() {
            if !rule.matches(in_iface, out_iface) {
                continue;
            }
            match &rule.verdict {
                Verdict::Return => return None,
                Verdict::Jump(target) => {
                    if let Some(verdict) = self.evaluate(target, in_iface, out_iface, depth + 1) {
                        return Some(verdict);
                    }
                }
                verdict => return Some(verdict.clone()),
            }
        }
        None
    }

    fn new_link(&mut self, ns: Namespace, name: &str, kind: LinkKind) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.links.push(Link {
            id,
            ns,
            name: name.to_string(),
            kind,
            peer: None,
            master: None,
            up: false,
        });
        id
    }
}

#[derive(Default)]
pub struct FakeNetworkOperator {
    state: Mutex<State>,
}

impl FakeNetworkOperator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a desktop process namespace exist
    pub fn spawn_namespace(&self, pid: u32) {
        self.state.lock().alive.insert(pid);
    }

    /// Simulate the desktop container dying: its namespace and every link
    /// inside it vanish, leaving peers behind in the host namespace.
    pub fn destroy_namespace(&self, pid: u32) {
        let mut st = self.state.lock();
        st.alive.remove(&pid);
        st.links.retain(|l| l.ns != Namespace::Process(pid));
        st.routes.retain(|(ns, _)| *ns != Namespace::Process(pid));
        st.nat.remove(&Namespace::Process(pid));
    }

    /// Pre-populate a link, as if left over from an earlier process
    pub fn seed_link(&self, name: &str, kind: LinkKind) {
        self.state.lock().new_link(Namespace::Host, name, kind);
    }

    pub fn seed_veth_pair(&self, name: &str, peer: &str, master: Option<&str>) {
        let mut st = self.state.lock();
        let a = st.new_link(Namespace::Host, name, LinkKind::Veth);
        let b = st.new_link(Namespace::Host, peer, LinkKind::Veth);
        for l in st.links.iter_mut() {
            if l.id == a {
                l.peer = Some(b);
                l.master = master.map(str::to_string);
            } else if l.id == b {
                l.peer = Some(a);
            }
        }
    }

    pub fn set_default_gateway(&self, gw: Option<Ipv4Addr>) {
        self.state.lock().default_gateway = gw;
    }

    /// Make every call to `op` fail (names match the trait methods)
    pub fn fail(&self, op: &'static str) {
        self.state.lock().failing.insert(op);
    }

    pub fn heal(&self, op: &'static str) {
        self.state.lock().failing.remove(op);
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.state.lock().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.state.lock().mutations.clear();
    }

    pub fn has_link(&self, ns: Namespace, name: &str) -> bool {
        self.state.lock().find(ns, name).is_some()
    }

    pub fn links(&self, ns: Namespace) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .links
            .iter()
            .filter(|l| l.ns == ns)
            .map(|l| l.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn master_of(&self, name: &str) -> Option<String> {
        let st = self.state.lock();
        st.find(Namespace::Host, name)
            .and_then(|i| st.links[i].master.clone())
    }

    pub fn is_up(&self, ns: Namespace, name: &str) -> bool {
        let st = self.state.lock();
        st.find(ns, name).map(|i| st.links[i].up).unwrap_or(false)
    }

    pub fn nat_rules(&self, ns: Namespace) -> Vec<NatRule> {
        self.state.lock().nat.get(&ns).cloned().unwrap_or_default()
    }

    pub fn routes(&self, ns: Namespace) -> Vec<Route> {
        self.state
            .lock()
            .routes
            .iter()
            .filter(|(n, _)| *n == ns)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn sysctl(&self, ns: Namespace, key: &str) -> Option<String> {
        self.state.lock().sysctls.get(&(ns, key.to_string())).cloned()
    }

    pub fn has_isolation(&self, bridge: &str) -> bool {
        self.state
            .lock()
            .filter
            .get(USER_CHAIN)
            .map_or(false, |rules| rules.contains(&FilterRule::isolation(bridge)))
    }

    pub fn filter_chain(&self, chain: &str) -> Vec<FilterRule> {
        self.state.lock().filter.get(chain).cloned().unwrap_or_default()
    }

    /// What a daemon owning `bridge` does to FORWARD when it starts: accept
    /// traffic leaving its bridge at the top, then move the DOCKER-USER
    /// jump above everything.
    pub fn apply_daemon_forward_rules(&self, bridge: &str) {
        let mut st = self.state.lock();
        let forward = st.filter.entry("FORWARD".to_string()).or_default();
        for out_negated in [true, false] {
            forward.insert(
                0,
                FilterRule {
                    in_iface: Some(IfaceMatch { name: bridge.to_string(), negated: false }),
                    out_iface: Some(IfaceMatch { name: bridge.to_string(), negated: out_negated }),
                    verdict: Verdict::Accept,
                },
            );
        }
        st.arrange_user_chain();
    }

    /// Verdict for a new connection routed from `in_iface` to `out_iface`;
    /// the FORWARD policy is ACCEPT
    pub fn forward_verdict(&self, in_iface: &str, out_iface: &str) -> Verdict {
        self.state
            .lock()
            .evaluate("FORWARD", in_iface, out_iface, 0)
            .unwrap_or(Verdict::Accept)
    }
}

#[async_trait]
impl NetworkOperator for FakeNetworkOperator {
    async fn create_bridge(&self, name: &str, gateway: Ipv4Addr, prefix_len: u8) -> NetworkResult<()> {
        let mut st = self.state.lock();
        st.check_failing("create_bridge")?;
        st.mutations.push(Mutation::CreateBridge(name.to_string()));
        if st.find(Namespace::Host, name).is_none() {
            st.new_link(Namespace::Host, name, LinkKind::Bridge);
        }
        let network = Ipv4Addr::from(u32::from(gateway) & prefix_mask(prefix_len));
        st.routes.insert((
            Namespace::Host,
            Route {
                destination: network,
                prefix_len,
                via: None,
                device: Some(name.to_string()),
            },
        ));
        if let Some(i) = st.find(Namespace::Host, name) {
            st.links[i].up = true;
        }
        Ok(())
    }

    async fn delete_interface(&self, name: &str) -> NetworkResult<()> {
        let mut st = self.state.lock();
        st.check_failing("delete_interface")?;
        if let Some(i) = st.find(Namespace::Host, name) {
            st.mutations.push(Mutation::DeleteInterface(name.to_string()));
            st.remove_link(i);
            let name = name.to_string();
            st.routes
                .retain(|(ns, r)| !(*ns == Namespace::Host && r.device.as_deref() == Some(name.as_str())));
        }
        Ok(())
    }

    async fn delete_namespace_interface(&self, ns: Namespace, name: &str) -> NetworkResult<()> {
        let mut st = self.state.lock();
        st.check_failing("delete_namespace_interface")?;
        st.check_ns(ns)?;
        if let Some(i) = st.find(ns, name) {
            st.mutations
                .push(Mutation::DeleteNamespaceInterface(ns, name.to_string()));
            st.remove_link(i);
        }
        Ok(())
    }

    async fn list_interfaces(&self, prefix: &str) -> NetworkResult<Vec<String>> {
        let st = self.state.lock();
        st.check_failing("list_interfaces")?;
        Ok(st
            .links
            .iter()
            .filter(|l| l.ns == Namespace::Host && l.name.starts_with(prefix))
            .map(|l| l.name.clone())
            .collect())
    }

    async fn create_veth_pair(&self, name: &str, peer: &str) -> NetworkResult<()> {
        let mut st = self.state.lock();
        st.check_failing("create_veth_pair")?;
        for n in [name, peer] {
            if st.find(Namespace::Host, n).is_some() {
                return Err(NetworkError::Command {
                    cmd: format!("ip link add {} type veth peer name {}", name, peer),
                    stderr: "RTNETLINK answers: File exists".to_string(),
                });
            }
        }
        st.mutations
            .push(Mutation::CreateVeth(name.to_string(), peer.to_string()));
        let a = st.new_link(Namespace::Host, name, LinkKind::Veth);
        let b = st.new_link(Namespace::Host, peer, LinkKind::Veth);
        for l in st.links.iter_mut() {
            if l.id == a {
                l.peer = Some(b);
            } else if l.id == b {
                l.peer = Some(a);
            }
        }
        Ok(())
    }

    async fn attach_to_bridge(&self, iface: &str, bridge: &str) -> NetworkResult<()> {
        let mut st = self.state.lock();
        st.check_failing("attach_to_bridge")?;
        if st.find(Namespace::Host, bridge).is_none() {
            return Err(NetworkError::NotFound(format!("link {}", bridge)));
        }
        let i = st
            .find(Namespace::Host, iface)
            .ok_or_else(|| NetworkError::NotFound(format!("link {}", iface)))?;
        st.links[i].master = Some(bridge.to_string());
        st.links[i].up = true;
        st.mutations
            .push(Mutation::Attach(iface.to_string(), bridge.to_string()));
        Ok(())
    }

    async fn move_to_namespace(&self, iface: &str, pid: u32) -> NetworkResult<()> {
        let mut st = self.state.lock();
        st.check_failing("move_to_namespace")?;
        st.check_ns(Namespace::Process(pid))?;
        let i = st
            .find(Namespace::Host, iface)
            .ok_or_else(|| NetworkError::NotFound(format!("link {}", iface)))?;
        st.links[i].ns = Namespace::Process(pid);
        st.links[i].up = false;
        st.mutations
            .push(Mutation::MoveToNamespace(iface.to_string(), pid));
        Ok(())
    }

    async fn rename_interface(&self, ns: Namespace, name: &str, new_name: &str) -> NetworkResult<()> {
        let mut st = self.state.lock();
        st.check_failing("rename_interface")?;
        st.check_ns(ns)?;
        if st.find(ns, new_name).is_some() {
            return Err(NetworkError::Command {
                cmd: format!("ip link set {} name {}", name, new_name),
                stderr: "RTNETLINK answers: File exists".to_string(),
            });
        }
        let i = st
            .find(ns, name)
            .ok_or_else(|| NetworkError::NotFound(format!("link {}", name)))?;
        st.links[i].name = new_name.to_string();
        st.mutations
            .push(Mutation::Rename(ns, name.to_string(), new_name.to_string()));
        Ok(())
    }

    async fn assign_address(&self, ns: Namespace, iface: &str, addr: Ipv4Addr, prefix_len: u8) -> NetworkResult<()> {
        let mut st = self.state.lock();
        st.check_failing("assign_address")?;
        st.check_ns(ns)?;
        st.find(ns, iface)
            .ok_or_else(|| NetworkError::NotFound(format!("link {}", iface)))?;
        st.mutations
            .push(Mutation::AssignAddress(ns, iface.to_string(), addr, prefix_len));
        if prefix_len < 32 {
            // kernel-created connected route
            st.routes.insert((
                ns,
                Route {
                    destination: Ipv4Addr::from(u32::from(addr) & prefix_mask(prefix_len)),
                    prefix_len,
                    via: None,
                    device: Some(iface.to_string()),
                },
            ));
        }
        Ok(())
    }

    async fn set_link_up(&self, ns: Namespace, iface: &str) -> NetworkResult<()> {
        let mut st = self.state.lock();
        st.check_failing("set_link_up")?;
        st.check_ns(ns)?;
        let i = st
            .find(ns, iface)
            .ok_or_else(|| NetworkError::NotFound(format!("link {}", iface)))?;
        st.links[i].up = true;
        st.mutations.push(Mutation::LinkUp(ns, iface.to_string()));
        Ok(())
    }

    async fn add_route(&self, ns: Namespace, route: &Route) -> NetworkResult<()> {
        let mut st = self.state.lock();
        st.check_failing("add_route")?;
        st.check_ns(ns)?;
        let exists = st.routes.iter().any(|(n, r)| {
            *n == ns && r.destination == route.destination && r.prefix_len == route.prefix_len
        });
        if exists {
            return Err(NetworkError::Command {
                cmd: format!("ip route add {}", route),
                stderr: "RTNETLINK answers: File exists".to_string(),
            });
        }
        st.routes.insert((ns, route.clone()));
        st.mutations.push(Mutation::AddRoute(ns, route.clone()));
        Ok(())
    }

    async fn install_nat_rule(&self, ns: Namespace, rule: &NatRule) -> NetworkResult<()> {
        let mut st = self.state.lock();
        st.check_failing("install_nat_rule")?;
        st.check_ns(ns)?;
        let rules = st.nat.entry(ns).or_default();
        rules.retain(|r| r != rule);
        rules.push(rule.clone());
        st.mutations.push(Mutation::InstallNat(ns, rule.clone()));
        Ok(())
    }

    async fn remove_nat_rule(&self, ns: Namespace, rule: &NatRule) -> NetworkResult<()> {
        let mut st = self.state.lock();
        st.check_failing("remove_nat_rule")?;
        st.check_ns(ns)?;
        if let Some(rules) = st.nat.get_mut(&ns) {
            rules.retain(|r| r != rule);
        }
        st.mutations.push(Mutation::RemoveNat(ns, rule.clone()));
        Ok(())
    }

    async fn set_sysctl(&self, ns: Namespace, key: &str, value: &str) -> NetworkResult<()> {
        let mut st = self.state.lock();
        st.check_failing("set_sysctl")?;
        st.check_ns(ns)?;
        st.sysctls.insert((ns, key.to_string()), value.to_string());
        st.mutations
            .push(Mutation::Sysctl(ns, key.to_string(), value.to_string()));
        Ok(())
    }

    async fn install_isolation(&self, bridge: &str) -> NetworkResult<()> {
        let mut st = self.state.lock();
        st.check_failing("install_isolation")?;
        st.ensure_user_chain();
        let rule = FilterRule::isolation(bridge);
        let chain = st.filter.entry(USER_CHAIN.to_string()).or_default();
        chain.retain(|r| *r != rule);
        chain.insert(0, rule);
        st.mutations
            .push(Mutation::InstallIsolation(bridge.to_string()));
        Ok(())
    }

    async fn remove_isolation(&self, bridge: &str) -> NetworkResult<()> {
        let mut st = self.state.lock();
        st.check_failing("remove_isolation")?;
        let rule = FilterRule::isolation(bridge);
        if let Some(chain) = st.filter.get_mut(USER_CHAIN) {
            chain.retain(|r| *r != rule);
        }
        st.mutations
            .push(Mutation::RemoveIsolation(bridge.to_string()));
        Ok(())
    }

    async fn default_gateway(&self) -> NetworkResult<Option<Ipv4Addr>> {
        Ok(self.state.lock().default_gateway)
    }
}
