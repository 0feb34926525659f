//! Transparent-proxy inbounds (redirect and TPROXY)
//!
//! No handshake happens here; the original destination is recovered from
//! kernel-side socket state before forming the context. Linux only - the
//! constructors return `Unsupported` elsewhere.

#[cfg(target_os = "linux")]
use std::net::SocketAddr;

#[cfg(target_os = "linux")]
use crate::common::{Address, InboundKind, Metadata};
use crate::error::Result;

#[cfg(not(target_os = "linux"))]
use crate::error::Error;

#[cfg(target_os = "linux")]
use super::ConnContext;
use super::{ListenerHandle, TcpSender, UdpSender};

/// Create the redirect (REDIRECT/DNAT) TCP listener.
///
/// The original destination is read from `SO_ORIGINAL_DST` on each accepted
/// socket.
#[cfg(target_os = "linux")]
pub async fn new_redir(addr: &str, tx: TcpSender) -> Result<ListenerHandle> {
    ListenerHandle::new_tcp(addr, move |stream, source| {
        let tx = tx.clone();
        tokio::spawn(async move {
            super::apply_keepalive(&stream);
            let Ok(original) = sys::original_dst(&stream) else {
                return;
            };
            let metadata = Metadata::new(Address::socket(original), InboundKind::Redir)
                .with_source(Address::socket(source));
            let ctx = ConnContext::new(metadata, Box::new(stream));
            if let Err(e) = super::send_context(&tx, ctx).await {
                tracing::debug!("redirected connection from {} dropped: {}", source, e);
            }
        });
    })
    .await
}

/// Create the TPROXY TCP listener.
///
/// The listening socket carries `IP_TRANSPARENT`; the accepted socket's
/// local address is the client's intended destination.
#[cfg(target_os = "linux")]
pub async fn new_tproxy(addr: &str, tx: TcpSender) -> Result<ListenerHandle> {
    let bind = crate::common::to_socket_addr(addr)?;
    let listener = sys::bind_transparent_tcp(bind)?;
    ListenerHandle::accept_loop(addr, listener, move |stream, source| {
        let tx = tx.clone();
        tokio::spawn(async move {
            super::apply_keepalive(&stream);
            let Ok(original) = stream.local_addr() else {
                return;
            };
            let metadata = Metadata::new(Address::socket(original), InboundKind::Tproxy)
                .with_source(Address::socket(source));
            let ctx = ConnContext::new(metadata, Box::new(stream));
            if let Err(e) = super::send_context(&tx, ctx).await {
                tracing::debug!("tproxy connection from {} dropped: {}", source, e);
            }
        });
    })
}

/// Create the TPROXY UDP listener (also serves the redirect UDP side).
///
/// Each datagram's original destination arrives in ancillary data.
#[cfg(target_os = "linux")]
pub async fn new_tproxy_udp(addr: &str, tx: UdpSender) -> Result<ListenerHandle> {
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use bytes::Bytes;
    use tracing::debug;

    use crate::common::Network;
    use super::PacketAdapter;

    let bind = crate::common::to_socket_addr(addr)?;
    let socket = Arc::new(sys::bind_transparent_udp(bind)?);
    let local = socket.local_addr()?;
    let closed = Arc::new(AtomicBool::new(false));

    let sock = socket.clone();
    let raw = addr.to_string();
    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            if let Err(e) = sock.readable().await {
                debug!("tproxy udp wait on {} failed: {}", raw, e);
                break;
            }
            let received = match sys::recv_with_original_dst(sock.as_raw_fd(), &mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    debug!("tproxy udp read on {} failed: {}", raw, e);
                    continue;
                }
            };
            let (n, source, original) = received;

            let metadata = Metadata::new(Address::socket(original), InboundKind::Tproxy)
                .with_source(Address::socket(source))
                .with_network(Network::Udp);
            let packet = TproxyPacket {
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

#[cfg(not(target_os = "linux"))]
pub async fn new_redir(_addr: &str, _tx: TcpSender) -> Result<ListenerHandle> {
    Err(Error::Unsupported("redir requires linux".into()))
}

#[cfg(not(target_os = "linux"))]
pub async fn new_tproxy(_addr: &str, _tx: TcpSender) -> Result<ListenerHandle> {
    Err(Error::Unsupported("tproxy requires linux".into()))
}

#[cfg(not(target_os = "linux"))]
pub async fn new_tproxy_udp(_addr: &str, _tx: UdpSender) -> Result<ListenerHandle> {
    Err(Error::Unsupported("tproxy requires linux".into()))
}

#[cfg(target_os = "linux")]
struct TproxyPacket {
    socket: std::sync::Arc<tokio::net::UdpSocket>,
    source: SocketAddr,
    payload: bytes::Bytes,
}

#[cfg(target_os = "linux")]
#[async_trait::async_trait]
impl super::UdpPacket for TproxyPacket {
    fn data(&self) -> &bytes::Bytes {
        &self.payload
    }

    async fn write_back(&self, data: &[u8], _from: &Address) -> std::io::Result<usize> {
        self.socket.send_to(data, self.source).await
    }
}

#[cfg(target_os = "linux")]
mod sys {
    //! Kernel plumbing: IP_TRANSPARENT sockets, SO_ORIGINAL_DST, and
    //! per-datagram original destinations from recvmsg ancillary data.

    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
    use std::os::unix::io::{AsRawFd, RawFd};

    use socket2::{Domain, Protocol, Socket, Type};
    use tokio::net::{TcpListener, TcpStream, UdpSocket};

    use crate::error::Result;

    const SO_ORIGINAL_DST: libc::c_int = 80;
    const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;
    const IP_TRANSPARENT: libc::c_int = 19;
    const IP_RECVORIGDSTADDR: libc::c_int = 20;

    fn set_ip_transparent(socket: &Socket) -> io::Result<()> {
        let one: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_IP,
                IP_TRANSPARENT,
                std::ptr::addr_of!(one).cast::<libc::c_void>(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_recv_original_dst(socket: &Socket) -> io::Result<()> {
        let one: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_IP,
                IP_RECVORIGDSTADDR,
                std::ptr::addr_of!(one).cast::<libc::c_void>(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn bind_transparent_tcp(addr: SocketAddr) -> Result<TcpListener> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        set_ip_transparent(&socket)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        Ok(TcpListener::from_std(socket.into())?)
    }

    pub(super) fn bind_transparent_udp(addr: SocketAddr) -> Result<UdpSocket> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        set_ip_transparent(&socket)?;
        set_recv_original_dst(&socket)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    /// Original destination of a REDIRECT-ed TCP connection
    pub(super) fn original_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
        let fd = stream.as_raw_fd();
        original_dst_v4(fd).or_else(|_| original_dst_v6(fd))
    }

    fn original_dst_v4(fd: RawFd) -> io::Result<SocketAddr> {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_IP,
                SO_ORIGINAL_DST,
                std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
                &mut len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let port = u16::from_be(addr.sin_port);
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }

    fn original_dst_v6(fd: RawFd) -> io::Result<SocketAddr> {
        let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_IPV6,
                IP6T_SO_ORIGINAL_DST,
                std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
                &mut len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let port = u16::from_be(addr.sin6_port);
        let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
        Ok(SocketAddr::V6(SocketAddrV6::new(
            ip,
            port,
            addr.sin6_flowinfo,
            addr.sin6_scope_id,
        )))
    }

    /// recvmsg with an ancillary buffer; returns (len, source, original dst)
    pub(super) fn recv_with_original_dst(
        fd: RawFd,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, SocketAddr)> {
        let mut name: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut control = [0u8; 64];

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = std::ptr::addr_of_mut!(name).cast::<libc::c_void>();
        msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast::<libc::c_void>();
        msg.msg_controllen = control.len();

        let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let source = SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(name.sin_addr.s_addr)),
            u16::from_be(name.sin_port),
        ));

        let mut original = None;
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        while !cmsg.is_null() {
            let header = unsafe { &*cmsg };
            if header.cmsg_level == libc::SOL_IP && header.cmsg_type == IP_RECVORIGDSTADDR {
                let addr =
                    unsafe { &*(libc::CMSG_DATA(cmsg).cast::<libc::sockaddr_in>()) };
                original = Some(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                    u16::from_be(addr.sin_port),
                )));
                break;
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
        }

        let original = original.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "no original destination in cmsg")
        })?;
        Ok((n as usize, source, original))
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_redir_listener_binds_and_closes() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = new_redir("127.0.0.1:0", tx).await.unwrap();
        assert_eq!(handle.raw_address(), "127.0.0.1:0");
        assert_ne!(handle.address().port(), 0);
        handle.close();
    }
}
