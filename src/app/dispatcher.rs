//! Dispatcher - the ingress consumer
//!
//! Drains the ingress channels, dials the destination directly, wraps every
//! outbound in a flow tracker, and relays. This is the built-in stand-in for
//! a full rule-driven router: tunnels pin their proxy name into the chain,
//! everything else is DIRECT.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info};

use crate::common::{Address, Metadata};
use crate::error::{Error, Result};
use crate::inbound::{ConnContext, PacketAdapter, TcpReceiver, UdpReceiver};
use crate::stats::{Chain, ChainedStream, Manager, OutboundDatagram, TcpTracker, UdpTracker};

/// Idle timeout for UDP associations
const UDP_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Dispatcher {
    manager: Arc<Manager>,
    udp_sessions: Mutex<HashMap<String, Arc<UdpSession>>>,
}

struct UdpSession {
    tracker: UdpTracker,
    adapter: PacketAdapter,
    last_seen: Mutex<Instant>,
}

impl Dispatcher {
    pub fn new(manager: Arc<Manager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            udp_sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Drain the TCP ingress channel; one task per flow.
    pub async fn run_tcp(self: Arc<Self>, mut rx: TcpReceiver) {
        while let Some(ctx) = rx.recv().await {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.handle_tcp(ctx).await {
                    debug!("tcp flow failed: {}", e);
                }
            });
        }
    }

    async fn handle_tcp(&self, ctx: ConnContext) -> Result<()> {
        let ConnContext {
            metadata,
            stream: mut inbound,
        } = ctx;

        let dest = resolve(&metadata.destination).await?;
        let outbound = TcpStream::connect(dest).await?;
        let _ = outbound.set_nodelay(true);

        let chain = chain_of(&metadata);
        info!("[{}] {} via {}", metadata.inbound, metadata, chain.join("/"));

        let conn = ChainedStream::new(Box::new(outbound), chain);
        let mut tracker = TcpTracker::new(conn, self.manager.clone(), metadata, None);

        let relayed = tokio::io::copy_bidirectional(&mut inbound, &mut tracker).await;
        let (up, down) = relayed.unwrap_or((0, 0));
        debug!("flow {} closed (up {} B, down {} B)", tracker.id(), up, down);
        tracker.close().await?;
        Ok(())
    }

    /// Drain the UDP ingress channel, demultiplexing by source address.
    pub async fn run_udp(self: Arc<Self>, mut rx: UdpReceiver) {
        while let Some(adapter) = rx.recv().await {
            match self.handle_udp(adapter).await {
                Ok(Some((key, session))) => {
                    tokio::spawn(self.clone().relay_replies(key, session));
                }
                Ok(None) => {}
                Err(e) => debug!("udp packet dropped: {}", e),
            }
        }
    }

    /// Forward one datagram; returns the new association when one was opened
    /// so the caller can start its reply pump.
    async fn handle_udp(&self, adapter: PacketAdapter) -> Result<Option<(String, Arc<UdpSession>)>> {
        let key = format!(
            "{}|{}",
            adapter.metadata.source, adapter.metadata.destination
        );

        let existing = self.udp_sessions.lock().get(&key).cloned();
        if let Some(session) = existing {
            *session.last_seen.lock() = Instant::now();
            session
                .tracker
                .send_to(adapter.data(), &adapter.metadata.destination)
                .await?;
            return Ok(None);
        }

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let datagram = DirectDatagram {
            socket,
            chain: chain_of(&adapter.metadata),
        };
        let tracker = UdpTracker::new(
            Box::new(datagram),
            self.manager.clone(),
            adapter.metadata.clone(),
            None,
        );
        tracker
            .send_to(adapter.data(), &adapter.metadata.destination)
            .await?;

        let session = Arc::new(UdpSession {
            tracker,
            adapter,
            last_seen: Mutex::new(Instant::now()),
        });
        self.udp_sessions.lock().insert(key.clone(), session.clone());
        Ok(Some((key, session)))
    }

    /// Pump replies back to the client until the association goes idle
    async fn relay_replies(self: Arc<Self>, key: String, session: Arc<UdpSession>) {
        let mut buf = vec![0u8; 65535];
        loop {
            match tokio::time::timeout(UDP_SESSION_TIMEOUT, session.tracker.recv_from(&mut buf))
                .await
            {
                Ok(Ok((n, from))) => {
                    *session.last_seen.lock() = Instant::now();
                    let from = Address::socket(from);
                    if session.adapter.write_back(&buf[..n], &from).await.is_err() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    debug!("udp association {} read failed: {}", key, e);
                    break;
                }
                Err(_) => {
                    if session.last_seen.lock().elapsed() >= UDP_SESSION_TIMEOUT {
                        break;
                    }
                }
            }
        }
        self.udp_sessions.lock().remove(&key);
    }
}

fn chain_of(metadata: &Metadata) -> Chain {
    match &metadata.special_proxy {
        Some(proxy) => vec![proxy.clone()],
        None => vec!["DIRECT".to_string()],
    }
}

async fn resolve(addr: &Address) -> Result<SocketAddr> {
    match addr {
        Address::Socket(socket) => Ok(*socket),
        Address::Domain(domain, port) => tokio::net::lookup_host((domain.as_str(), *port))
            .await?
            .next()
            .ok_or_else(|| Error::Resolve(format!("no addresses for {}", domain))),
    }
}

struct DirectDatagram {
    socket: UdpSocket,
    chain: Chain,
}

#[async_trait]
impl OutboundDatagram for DirectDatagram {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    async fn send_to(&self, buf: &[u8], target: &Address) -> io::Result<usize> {
        match target {
            Address::Socket(socket) => self.socket.send_to(buf, socket).await,
            Address::Domain(domain, port) => {
                let dest = tokio::net::lookup_host((domain.as_str(), *port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::NotFound, "unresolvable destination")
                    })?;
                self.socket.send_to(buf, dest).await
            }
        }
    }

    fn chain(&self) -> Chain {
        self.chain.clone()
    }
}

/// Spawn the consumer tasks plus the manager's rate ticker
pub fn start(
    dispatcher: Arc<Dispatcher>,
    manager: Arc<Manager>,
    tcp_rx: TcpReceiver,
    udp_rx: UdpReceiver,
) {
    tokio::spawn(dispatcher.clone().run_tcp(tcp_rx));
    tokio::spawn(dispatcher.run_udp(udp_rx));
    tokio::spawn(manager.run_ticker());
    info!("dispatcher started");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{InboundKind, Network};
    use crate::inbound::{ingress_channels, UdpPacket};
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_tcp_dispatch_relays_and_tracks() {
        // upstream echo server
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let manager = Manager::new();
        let dispatcher = Dispatcher::new(manager.clone());
        let ((tcp_tx, tcp_rx), _) = ingress_channels();
        tokio::spawn(dispatcher.run_tcp(tcp_rx));

        let (mut client, server) = tokio::io::duplex(1024);
        let metadata = Metadata::new(Address::socket(upstream_addr), InboundKind::Socks5)
            .with_source(Address::socket("10.0.0.2:9999".parse().unwrap()));
        tcp_tx
            .send(ConnContext::new(metadata, Box::new(server)))
            .await
            .unwrap();

        client.write_all(b"hello").await.unwrap();
        let mut echo = [0u8; 5];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"hello");

        let snap = manager.snapshot();
        assert_eq!(snap.upload_total, 5);
        assert_eq!(snap.download_total, 5);
    }

    struct LoopbackPacket {
        payload: Bytes,
        replies: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl UdpPacket for LoopbackPacket {
        fn data(&self) -> &Bytes {
            &self.payload
        }
        async fn write_back(&self, data: &[u8], _from: &Address) -> io::Result<usize> {
            let _ = self.replies.send(data.to_vec());
            Ok(data.len())
        }
    }

    #[tokio::test]
    async fn test_udp_dispatch_forwards_and_replies() {
        // upstream UDP echo
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = upstream.recv_from(&mut buf).await.unwrap();
            upstream.send_to(&buf[..n], from).await.unwrap();
        });

        let manager = Manager::new();
        let dispatcher = Dispatcher::new(manager.clone());
        let (_, (udp_tx, udp_rx)) = ingress_channels();
        tokio::spawn(dispatcher.run_udp(udp_rx));

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let metadata = Metadata::new(Address::socket(upstream_addr), InboundKind::Tunnel)
            .with_source(Address::socket("10.0.0.2:5353".parse().unwrap()))
            .with_network(Network::Udp)
            .with_special_proxy("pinned");
        let packet = LoopbackPacket {
            payload: Bytes::from_static(b"query"),
            replies: reply_tx,
        };
        udp_tx
            .send(PacketAdapter::new(metadata, Box::new(packet)))
            .await
            .unwrap();

        let reply = reply_rx.recv().await.unwrap();
        assert_eq!(reply, b"query");

        let snap = manager.snapshot();
        assert_eq!(snap.upload_total, 5);
        assert_eq!(snap.download_total, 5);
        assert_eq!(snap.connections[0].chain, vec!["pinned".to_string()]);
    }
}
