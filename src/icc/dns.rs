// src/icc/dns.rs
// Per-tenant DNS responder: tenant container names locally, everything else upstream

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use trust_dns_proto::op::{Message, MessageType, OpCode, ResponseCode};
use trust_dns_proto::rr::{rdata, DNSClass, RData, Record, RecordType};

/// Answers for tenant containers are short-lived; containers come and go
const LOCAL_TTL: u32 = 10;
const MAX_PACKET: usize = 4096;
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);
/// Stream clients that send nothing for this long are disconnected
const TCP_IDLE: Duration = Duration::from_secs(10);

/// How a query reached the responder; upstream relaying uses the same one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Udp,
    Tcp,
}

/// Source of names the responder is authoritative for
#[async_trait]
pub trait ContainerDirectory: Send + Sync {
    /// `name` is lowercase without the trailing dot
    async fn lookup(&self, name: &str) -> Option<Ipv4Addr>;
}

struct QueryResolver {
    directory: Arc<dyn ContainerDirectory>,
    upstreams: Vec<SocketAddr>,
    upstream_timeout: Duration,
}

impl QueryResolver {
    async fn resolve(&self, packet: &[u8], transport: Transport) -> Option<Vec<u8>> {
        let query = match Message::from_vec(packet) {
            Ok(q) => q,
            Err(e) => {
                tracing::debug!("Dropping unparseable DNS packet: {}", e);
                return None;
            }
        };
        if query.message_type() != MessageType::Query {
            return None;
        }

        if query.op_code() == OpCode::Query && query.queries().len() == 1 {
            let q = &query.queries()[0];
            let name = normalize_name(&q.name().to_ascii());
            if q.query_class() == DNSClass::IN {
                if let Some(ip) = self.directory.lookup(&name).await {
                    tracing::debug!(name = %name, ip = %ip, "Answering tenant container name");
                    return local_answer(&query, q.query_type(), ip).to_vec().ok();
                }
            }
        }

        match forward(packet, query.id(), &self.upstreams, self.upstream_timeout, transport).await {
            Some(reply) => Some(reply),
            None => {
                tracing::warn!(id = query.id(), "All upstream resolvers failed, answering SERVFAIL");
                error_reply(&query, ResponseCode::ServFail).to_vec().ok()
            }
        }
    }
}

pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn reply_to(query: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(query.op_code());
    response.set_recursion_desired(query.recursion_desired());
    response.set_recursion_available(true);
    for q in query.queries() {
        response.add_query(q.clone());
    }
    response
}

/// A record for A queries; other types on a known name get an empty NOERROR
fn local_answer(query: &Message, record_type: RecordType, ip: Ipv4Addr) -> Message {
    let mut response = reply_to(query);
    response.set_authoritative(true);
    response.set_response_code(ResponseCode::NoError);
    if record_type == RecordType::A {
        let name = query.queries()[0].name().clone();
        response.add_answer(Record::from_rdata(name, LOCAL_TTL, RData::A(rdata::A::from(ip))));
    }
    response
}

fn error_reply(query: &Message, code: ResponseCode) -> Message {
    let mut response = reply_to(query);
    response.set_response_code(code);
    response
}

/// Relay `packet` unmodified, trying upstreams in order.
async fn forward(
    packet: &[u8],
    id: u16,
    upstreams: &[SocketAddr],
    timeout: Duration,
    transport: Transport,
) -> Option<Vec<u8>> {
    for upstream in upstreams {
        let result = match transport {
            Transport::Udp => forward_one(packet, id, *upstream, timeout).await,
            Transport::Tcp => forward_one_tcp(packet, *upstream, timeout).await,
        };
        match result {
            Ok(reply) => return Some(reply),
            Err(e) => tracing::debug!(upstream = %upstream, "Upstream resolver failed: {}", e),
        }
    }
    None
}

async fn forward_one(packet: &[u8], id: u16, upstream: SocketAddr, timeout: Duration) -> std::io::Result<Vec<u8>> {
    let local: SocketAddr = if upstream.is_ipv4() {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(upstream).await?;
    socket.send(packet).await?;

    let mut buf = vec![0u8; MAX_PACKET];
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let len = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timed out"))??;
        // Ignore stray datagrams that do not answer this query
        if len >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == id {
            buf.truncate(len);
            return Ok(buf);
        }
    }
}

async fn forward_one_tcp(packet: &[u8], upstream: SocketAddr, timeout: Duration) -> std::io::Result<Vec<u8>> {
    tokio::time::timeout(timeout, async {
        let mut stream = TcpStream::connect(upstream).await?;
        write_framed(&mut stream, packet).await?;
        read_framed(&mut stream).await
    })
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timed out"))?
}

/// DNS over TCP: every message carries a two-byte big-endian length prefix
async fn read_framed<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u16().await? as usize;
    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await?;
    Ok(message)
}

async fn write_framed<S: AsyncWrite + Unpin>(stream: &mut S, message: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(message.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "DNS message exceeds 65535 bytes")
    })?;
    let mut frame = Vec::with_capacity(message.len() + 2);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(message);
    stream.write_all(&frame).await
}

/// Answer queries on one stream connection until the client goes quiet or hangs up
async fn serve_connection(mut stream: TcpStream, peer: SocketAddr, resolver: Arc<QueryResolver>) {
    loop {
        let packet = match tokio::time::timeout(TCP_IDLE, read_framed(&mut stream)).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(_)) | Err(_) => break,
        };
        let reply = match resolver.resolve(&packet, Transport::Tcp).await {
            Some(reply) => reply,
            None => break,
        };
        if let Err(e) = write_framed(&mut stream, &reply).await {
            tracing::debug!(client = %peer, "Failed to send DNS reply over TCP: {}", e);
            break;
        }
    }
}

pub struct DnsServer {
    socket: Arc<UdpSocket>,
    listener: TcpListener,
    resolver: Arc<QueryResolver>,
}

impl DnsServer {
    /// Bind UDP and TCP on the same address immediately so conflicts
    /// surface to the caller. Port 0 picks one port for both.
    pub async fn bind(
        addr: SocketAddr,
        directory: Arc<dyn ContainerDirectory>,
        upstreams: Vec<SocketAddr>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let listener = TcpListener::bind(socket.local_addr()?).await?;
        Ok(Self {
            socket: Arc::new(socket),
            listener,
            resolver: Arc::new(QueryResolver {
                directory,
                upstreams,
                upstream_timeout: UPSTREAM_TIMEOUT,
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until `shutdown` fires or its sender is dropped
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let addr = self.local_addr().ok();
        tracing::info!(addr = ?addr, upstreams = ?self.resolver.upstreams, "DNS responder listening");

        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => {
                        let packet = buf[..len].to_vec();
                        let socket = self.socket.clone();
                        let resolver = self.resolver.clone();
                        tokio::spawn(async move {
                            if let Some(reply) = resolver.resolve(&packet, Transport::Udp).await {
                                if let Err(e) = socket.send_to(&reply, src).await {
                                    tracing::debug!(client = %src, "Failed to send DNS reply: {}", e);
                                }
                            }
                        });
                    }
                    Err(e) => tracing::debug!("DNS receive error: {}", e),
                },
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(serve_connection(stream, peer, self.resolver.clone()));
                    }
                    Err(e) => tracing::debug!("DNS accept error: {}", e),
                },
            }
        }
        tracing::info!(addr = ?addr, "DNS responder stopped");
    }
}
