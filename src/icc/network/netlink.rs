use crate::icc::network::error::{NetworkError, NetworkResult};
use futures::TryStreamExt;
use netlink_packet_route::link::nlas::Nla as LinkNla;
use netlink_packet_route::route::nlas::Nla as RouteNla;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::AsRawFd;

/// rtnetlink connection bound to the network namespace it was opened in.
///
/// The bridger keeps one for the host namespace; in-namespace work opens a
/// short-lived one on a dedicated thread via [`NetlinkHandle::run_in_netns`].
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    _conn_task: tokio::task::JoinHandle<()>,
}

impl NetlinkHandle {
    /// Must be called inside a tokio runtime
    pub fn new() -> NetworkResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    // ── Links ─────────────────────────────────────────────────────────

    /// Create a bridge. Returns the existing ifindex if it is already there.
    pub async fn create_bridge(&self, name: &str) -> NetworkResult<u32> {
        if let Ok(idx) = self.get_link_index(name).await {
            return Ok(idx);
        }

        match self.handle.link().add().bridge(name.to_string()).execute().await {
            Ok(()) => {}
            Err(e) if e.to_string().contains("File exists") => {}
            Err(e) => return Err(NetworkError::Netlink(e)),
        }

        self.get_link_index(name).await
    }

    /// Create a veth pair; fails if either name is taken
    pub async fn create_veth_pair(&self, name: &str, peer: &str) -> NetworkResult<()> {
        self.handle
            .link()
            .add()
            .veth(name.to_string(), peer.to_string())
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn get_link_index(&self, name: &str) -> NetworkResult<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg.header.index),
            Ok(None) => Err(NetworkError::NotFound(format!("link {}", name))),
            Err(e) => {
                // Some kernels answer a name lookup miss with ENODEV
                if e.to_string().contains("No such device") {
                    Err(NetworkError::NotFound(format!("link {}", name)))
                } else {
                    Err(NetworkError::Netlink(e))
                }
            }
        }
    }

    /// Delete a link by name. Missing links are not an error.
    pub async fn delete_link(&self, name: &str) -> NetworkResult<()> {
        let index = match self.get_link_index(name).await {
            Ok(idx) => idx,
            Err(NetworkError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such device") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    pub async fn set_link_up(&self, name: &str) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_link_master(&self, name: &str, master: &str) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        let master_index = self.get_link_index(master).await?;
        self.handle
            .link()
            .set(index)
            .master(master_index)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_link_netns_by_pid(&self, name: &str, pid: u32) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .setns_by_pid(pid)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Rename a link. The link has to be down, which is the case right after a namespace move.
    pub async fn rename_link(&self, name: &str, new_name: &str) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .name(new_name.to_string())
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Names of all links starting with `prefix`
    pub async fn list_links_with_prefix(&self, prefix: &str) -> NetworkResult<Vec<String>> {
        let mut links = self.handle.link().get().execute();
        let mut names = Vec::new();

        while let Some(msg) = links.try_next().await.map_err(NetworkError::Netlink)? {
            for nla in &msg.nlas {
                if let LinkNla::IfName(name) = nla {
                    if name.starts_with(prefix) {
                        names.push(name.clone());
                    }
                }
            }
        }

        Ok(names)
    }

    // ── Addresses and routes ──────────────────────────────────────────

    /// Add an IPv4 address; an identical existing address is accepted
    pub async fn add_address(&self, name: &str, addr: Ipv4Addr, prefix_len: u8) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        match self
            .handle
            .address()
            .add(index, IpAddr::V4(addr), prefix_len)
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    /// `ip route add dest/len [via gw] [dev device]`. EEXIST is surfaced to the caller.
    pub async fn add_route(
        &self,
        destination: Ipv4Addr,
        prefix_len: u8,
        via: Option<Ipv4Addr>,
        device: Option<&str>,
    ) -> NetworkResult<()> {
        let mut request = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(destination, prefix_len);
        if let Some(gateway) = via {
            request = request.gateway(gateway);
        }
        if let Some(device) = device {
            let index = self.get_link_index(device).await?;
            request = request.output_interface(index);
        }
        request.execute().await.map_err(NetworkError::Netlink)
    }

    /// Gateway of the IPv4 default route, if the namespace has one
    pub async fn default_gateway(&self) -> NetworkResult<Option<Ipv4Addr>> {
        let mut routes = self.handle.route().get(rtnetlink::IpVersion::V4).execute();
        while let Some(route) = routes.try_next().await.map_err(NetworkError::Netlink)? {
            if route.header.destination_prefix_length != 0 {
                continue;
            }
            for nla in &route.nlas {
                if let RouteNla::Gateway(bytes) = nla {
                    if bytes.len() == 4 {
                        return Ok(Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])));
                    }
                }
            }
        }
        Ok(None)
    }

    // ── In-namespace execution ────────────────────────────────────────
    // setns() switches the calling OS thread only, so this never runs on a
    // runtime worker: a fresh std thread enters the namespace, opens its own
    // netlink socket there and exits when `op` completes.

    /// Run `op` with a netlink handle opened inside the network namespace of `pid`
    pub async fn run_in_netns<F, Fut, T>(pid: u32, op: F) -> NetworkResult<T>
    where
        F: FnOnce(NetlinkHandle) -> Fut + Send + 'static,
        Fut: Future<Output = NetworkResult<T>>,
        T: Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();

        std::thread::spawn(move || {
            let result = Self::enter_and_run(pid, op);
            let _ = tx.send(result);
        });

        rx.await
            .map_err(|_| NetworkError::Namespace("in-namespace thread panicked".to_string()))?
    }

    fn enter_and_run<F, Fut, T>(pid: u32, op: F) -> NetworkResult<T>
    where
        F: FnOnce(NetlinkHandle) -> Fut,
        Fut: Future<Output = NetworkResult<T>>,
    {
        use nix::sched::{setns, CloneFlags};

        let ns_path = format!("/proc/{}/ns/net", pid);
        let ns_fd = std::fs::File::open(&ns_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                NetworkError::NotFound(format!("network namespace of pid {}", pid))
            } else {
                NetworkError::Namespace(format!("failed to open {}: {}", ns_path, e))
            }
        })?;

        setns(ns_fd.as_raw_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| NetworkError::Namespace(format!("setns failed for pid {}: {}", pid, e)))?;

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(NetworkError::Io)?;

        rt.block_on(async move {
            let nl = NetlinkHandle::new()?;
            op(nl).await
        })
    }
}
