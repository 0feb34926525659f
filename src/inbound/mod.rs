//! Inbound dispatchers
//!
//! One module per ingress protocol. Each accepted connection is normalized
//! into a [`ConnContext`] (TCP) or [`PacketAdapter`] (UDP) and emitted on the
//! ingress channel consumed by the router.

pub mod http;
pub mod mixed;
pub mod redirect;
pub mod socks;
pub mod tunnel;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::common::{to_socket_addr, Address, Metadata, Stream};
use crate::error::{Error, Result};

/// Capacity of the ingress channels. Senders block when the router lags;
/// connections are never dropped.
pub const INGRESS_BACKLOG: usize = 96;

/// The envelope delivered to the router for each accepted flow.
///
/// Ownership of the stream moves to the receiver; a context crosses the
/// ingress channel exactly once.
pub struct ConnContext {
    pub metadata: Metadata,
    pub stream: Stream,
}

impl ConnContext {
    pub fn new(metadata: Metadata, stream: Stream) -> Self {
        Self { metadata, stream }
    }
}

pub type TcpSender = mpsc::Sender<ConnContext>;
pub type TcpReceiver = mpsc::Receiver<ConnContext>;
pub type UdpSender = mpsc::Sender<PacketAdapter>;
pub type UdpReceiver = mpsc::Receiver<PacketAdapter>;

/// Create a TCP + UDP ingress channel pair
pub fn ingress_channels() -> ((TcpSender, TcpReceiver), (UdpSender, UdpReceiver)) {
    (
        mpsc::channel(INGRESS_BACKLOG),
        mpsc::channel(INGRESS_BACKLOG),
    )
}

/// One inbound datagram plus the way back to its sender.
///
/// `write_back` delivers a reply to the client, re-encapsulating it however
/// the ingress protocol requires (SOCKS5 UDP header, plain datagram, ...).
#[async_trait]
pub trait UdpPacket: Send + Sync {
    fn data(&self) -> &Bytes;
    async fn write_back(&self, data: &[u8], from: &Address) -> io::Result<usize>;
}

/// A UDP ingress unit: destination metadata plus the packet itself
pub struct PacketAdapter {
    pub metadata: Metadata,
    packet: Box<dyn UdpPacket>,
}

impl PacketAdapter {
    pub fn new(metadata: Metadata, packet: Box<dyn UdpPacket>) -> Self {
        Self { metadata, packet }
    }

    pub fn data(&self) -> &Bytes {
        self.packet.data()
    }

    pub async fn write_back(&self, data: &[u8], from: &Address) -> io::Result<usize> {
        self.packet.write_back(data, from).await
    }
}

/// Deliver a context to the router.
///
/// A closed ingress channel surfaces as an error so the handler task winds
/// down instead of panicking; the connection is dropped with it.
pub(crate) async fn send_context(tx: &TcpSender, ctx: ConnContext) -> Result<()> {
    tx.send(ctx).await.map_err(|_| Error::ChannelClosed)
}

/// Enable a 30 s TCP keepalive on an accepted socket
pub(crate) fn apply_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
    let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
}

/// An open ingress endpoint: the accept task plus its close flag.
///
/// `close` flips the flag before tearing the task down, so a racing accept
/// error exits quietly instead of logging.
pub struct ListenerHandle {
    raw_address: String,
    address: SocketAddr,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Bind a TCP listener and run an accept loop that hands each accepted
    /// socket to `handler` (which spawns the per-connection task).
    pub(crate) async fn new_tcp<F>(raw_address: &str, handler: F) -> Result<Self>
    where
        F: Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
    {
        let bind = to_socket_addr(raw_address)?;
        let listener = TcpListener::bind(bind).await?;
        Self::accept_loop(raw_address, listener, handler)
    }

    /// Run the accept loop over an already-bound listener (tproxy builds its
    /// socket with special options before handing it over).
    pub(crate) fn accept_loop<F>(
        raw_address: &str,
        listener: TcpListener,
        handler: F,
    ) -> Result<Self>
    where
        F: Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
    {
        let address = listener.local_addr()?;
        let closed = Arc::new(AtomicBool::new(false));

        let flag = closed.clone();
        let raw = raw_address.to_string();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, source)) => handler(stream, source),
                    Err(e) => {
                        if flag.load(Ordering::Relaxed) {
                            break;
                        }
                        debug!("accept on {} failed: {}", raw, e);
                    }
                }
            }
        });

        Ok(Self {
            raw_address: raw_address.to_string(),
            address,
            closed,
            task,
        })
    }

    /// Wrap an already-running read task (UDP listeners)
    pub(crate) fn from_task(
        raw_address: &str,
        address: SocketAddr,
        closed: Arc<AtomicBool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            raw_address: raw_address.to_string(),
            address,
            closed,
            task,
        }
    }

    /// The address as configured
    pub fn raw_address(&self) -> &str {
        &self.raw_address
    }

    /// The resolved local endpoint
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.task.abort();
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.close();
    }
}
