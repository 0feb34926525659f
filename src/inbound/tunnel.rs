//! Static tunnels: every connection or datagram accepted on a local port is
//! forwarded to a fixed target through a fixed proxy.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::common::{parse_host_port, to_socket_addr, Address, InboundKind, Metadata, Network};
use crate::error::{Error, Result};

use super::{
    apply_keepalive, ConnContext, ListenerHandle, PacketAdapter, TcpSender, UdpPacket, UdpSender,
};

fn parse_target(target: &str) -> Result<Address> {
    let parsed = parse_host_port(target, 0)?;
    if parsed.port() == 0 {
        return Err(Error::InvalidAddress(format!(
            "tunnel target needs a port: {}",
            target
        )));
    }
    Ok(parsed)
}

/// Create a TCP tunnel listener
pub async fn new(addr: &str, target: &str, proxy: &str, tx: TcpSender) -> Result<ListenerHandle> {
    let target = parse_target(target)?;
    let proxy = proxy.to_string();

    ListenerHandle::new_tcp(addr, move |stream, source| {
        let tx = tx.clone();
        let target = target.clone();
        let proxy = proxy.clone();
        tokio::spawn(async move {
            apply_keepalive(&stream);
            let metadata = Metadata::new(target, InboundKind::Tunnel)
                .with_source(Address::socket(source))
                .with_special_proxy(proxy);
            let ctx = ConnContext::new(metadata, Box::new(stream));
            if let Err(e) = super::send_context(&tx, ctx).await {
                debug!("tunnel connection from {} dropped: {}", source, e);
            }
        });
    })
    .await
}

/// Create a UDP tunnel listener
pub async fn new_udp(
    addr: &str,
    target: &str,
    proxy: &str,
    tx: UdpSender,
) -> Result<ListenerHandle> {
    let target = parse_target(target)?;
    let proxy = proxy.to_string();

    let bind = to_socket_addr(addr)?;
    let socket = Arc::new(UdpSocket::bind(bind).await?);
    let local = socket.local_addr()?;
    let closed = Arc::new(AtomicBool::new(false));

    let sock = socket.clone();
    let raw = addr.to_string();
    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            let (n, source) = match sock.recv_from(&mut buf).await {
                Ok(read) => read,
                Err(e) => {
                    debug!("udp read on {} failed: {}", raw, e);
                    continue;
                }
            };

            let metadata = Metadata::new(target.clone(), InboundKind::Tunnel)
                .with_source(Address::socket(source))
                .with_network(Network::Udp)
                .with_special_proxy(proxy.clone());
            let packet = TunnelPacket {
                socket: sock.clone(),
                source,
                payload: Bytes::copy_from_slice(&buf[..n]),
            };
            if tx
                .send(PacketAdapter::new(metadata, Box::new(packet)))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    Ok(ListenerHandle::from_task(addr, local, closed, task))
}

struct TunnelPacket {
    socket: Arc<UdpSocket>,
    source: SocketAddr,
    payload: Bytes,
}

#[async_trait::async_trait]
impl UdpPacket for TunnelPacket {
    fn data(&self) -> &Bytes {
        &self.payload
    }

    async fn write_back(&self, data: &[u8], _from: &Address) -> std::io::Result<usize> {
        self.socket.send_to(data, self.source).await
    }
}
