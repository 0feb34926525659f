//! SOCKS inbound
//!
//! The TCP listener sniffs the version byte and serves SOCKS4/4a and SOCKS5
//! on the same port. The UDP listener decapsulates SOCKS5 UDP datagrams and
//! emits packet adapters whose replies are re-encapsulated.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::auth::Authenticator;
use crate::common::{peek_one, to_socket_addr, Address, InboundKind, Metadata, Network};
use crate::error::{Error, Result};

use super::{
    apply_keepalive, ConnContext, ListenerHandle, PacketAdapter, TcpSender, UdpPacket, UdpSender,
};

pub const VERSION4: u8 = 0x04;
pub const VERSION5: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

const SOCKS4_GRANTED: u8 = 0x5A;
const SOCKS4_REJECTED: u8 = 0x5B;

/// Negotiated SOCKS5 command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    UdpAssociate,
}

/// Create the SOCKS TCP listener
pub async fn new(addr: &str, tx: TcpSender, auth: Arc<Authenticator>) -> Result<ListenerHandle> {
    ListenerHandle::new_tcp(addr, move |stream, source| {
        let tx = tx.clone();
        let auth = auth.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_socks(stream, source, auth, tx).await {
                debug!("socks connection from {} failed: {}", source, e);
            }
        });
    })
    .await
}

/// Sniff the version byte and run the matching handshake.
///
/// The peek leaves the byte in the buffer; handshakes read from position 0.
/// Anything that is not SOCKS is dropped.
pub(crate) async fn handle_socks(
    stream: TcpStream,
    source: SocketAddr,
    auth: Arc<Authenticator>,
    tx: TcpSender,
) -> Result<()> {
    apply_keepalive(&stream);
    let local_addr = stream.local_addr()?;
    let mut buffed = BufReader::new(stream);

    match peek_one(&mut buffed).await? {
        Some(VERSION4) => handle_socks4(buffed, source, auth, tx).await,
        Some(VERSION5) => handle_socks5(buffed, source, local_addr, auth, tx).await,
        _ => Ok(()),
    }
}

/// Run the SOCKS4 handshake and emit a connection context on success
pub(crate) async fn handle_socks4<S>(
    mut conn: S,
    source: SocketAddr,
    auth: Arc<Authenticator>,
    tx: TcpSender,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let target = server_handshake4(&mut conn, &auth).await?;

    let metadata = Metadata::new(target, InboundKind::Socks4).with_source(Address::socket(source));
    super::send_context(&tx, ConnContext::new(metadata, Box::new(conn))).await
}

/// Run the SOCKS5 handshake.
///
/// UDP-associate keeps the TCP socket open, draining whatever the client
/// sends until it closes; the UDP relay itself is served elsewhere. Every
/// other accepted command emits a connection context.
pub(crate) async fn handle_socks5<S>(
    mut conn: S,
    source: SocketAddr,
    local_addr: SocketAddr,
    auth: Arc<Authenticator>,
    tx: TcpSender,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (target, command) = server_handshake5(&mut conn, local_addr, &auth).await?;

    if command == Command::UdpAssociate {
        let _ = tokio::io::copy(&mut conn, &mut tokio::io::sink()).await;
        return Ok(());
    }

    let metadata = Metadata::new(target, InboundKind::Socks5).with_source(Address::socket(source));
    super::send_context(&tx, ConnContext::new(metadata, Box::new(conn))).await
}

/// SOCKS4/4a server handshake: returns the requested destination
pub(crate) async fn server_handshake4<S>(conn: &mut S, auth: &Authenticator) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 8];
    conn.read_exact(&mut header).await?;

    if header[0] != VERSION4 {
        return Err(Error::Protocol(format!("invalid SOCKS4 version: {}", header[0])));
    }
    let command = header[1];
    let port = u16::from_be_bytes([header[2], header[3]]);
    let ip = Ipv4Addr::new(header[4], header[5], header[6], header[7]);

    let user = read_until_nul(conn).await?;

    // 0.0.0.x with x != 0 marks a SOCKS4a request carrying a hostname
    let octets = ip.octets();
    let is_4a = octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0;
    let target = if is_4a {
        let host = read_until_nul(conn).await?;
        Address::Domain(host, port)
    } else {
        Address::Socket(SocketAddr::new(ip.into(), port))
    };

    if auth.enabled() && !auth.verify(&user, "") {
        let _ = conn.write_all(&[0x00, SOCKS4_REJECTED, 0, 0, 0, 0, 0, 0]).await;
        return Err(Error::AuthFailed);
    }
    if command != CMD_CONNECT {
        let _ = conn.write_all(&[0x00, SOCKS4_REJECTED, 0, 0, 0, 0, 0, 0]).await;
        return Err(Error::Protocol(format!("unsupported SOCKS4 command: {}", command)));
    }

    conn.write_all(&[0x00, SOCKS4_GRANTED, 0, 0, 0, 0, 0, 0]).await?;
    Ok(target)
}

/// SOCKS5 server handshake: method negotiation, optional username/password
/// sub-negotiation, request parse, reply.
pub(crate) async fn server_handshake5<S>(
    conn: &mut S,
    local_addr: SocketAddr,
    auth: &Authenticator,
) -> Result<(Address, Command)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // greeting
    let mut head = [0u8; 2];
    conn.read_exact(&mut head).await?;
    if head[0] != VERSION5 {
        return Err(Error::Protocol(format!("invalid SOCKS5 version: {}", head[0])));
    }
    let mut methods = vec![0u8; head[1] as usize];
    conn.read_exact(&mut methods).await?;

    let selected = if auth.enabled() {
        if methods.contains(&AUTH_PASSWORD) {
            AUTH_PASSWORD
        } else {
            AUTH_NO_ACCEPTABLE
        }
    } else if methods.contains(&AUTH_NONE) {
        AUTH_NONE
    } else {
        AUTH_NO_ACCEPTABLE
    };
    conn.write_all(&[VERSION5, selected]).await?;
    if selected == AUTH_NO_ACCEPTABLE {
        return Err(Error::Protocol("no acceptable auth method".into()));
    }

    if selected == AUTH_PASSWORD {
        let mut ver = [0u8; 1];
        conn.read_exact(&mut ver).await?;
        if ver[0] != 0x01 {
            return Err(Error::Protocol("invalid auth sub-negotiation version".into()));
        }
        let mut len = [0u8; 1];
        conn.read_exact(&mut len).await?;
        let mut user = vec![0u8; len[0] as usize];
        conn.read_exact(&mut user).await?;
        conn.read_exact(&mut len).await?;
        let mut pass = vec![0u8; len[0] as usize];
        conn.read_exact(&mut pass).await?;

        let user = String::from_utf8_lossy(&user);
        let pass = String::from_utf8_lossy(&pass);
        if auth.verify(&user, &pass) {
            conn.write_all(&[0x01, 0x00]).await?;
        } else {
            conn.write_all(&[0x01, 0x01]).await?;
            return Err(Error::AuthFailed);
        }
    }

    // request
    let mut request = [0u8; 4];
    conn.read_exact(&mut request).await?;
    if request[0] != VERSION5 {
        return Err(Error::Protocol("invalid SOCKS5 version in request".into()));
    }
    let target = match read_addr(conn, request[3]).await {
        Ok(target) => target,
        Err(e) => {
            let _ = write_reply(conn, REP_ATYP_NOT_SUPPORTED, None).await;
            return Err(e);
        }
    };

    match request[1] {
        CMD_CONNECT => {
            write_reply(conn, REP_SUCCESS, None).await?;
            Ok((target, Command::Connect))
        }
        CMD_UDP_ASSOCIATE => {
            // the UDP endpoint shares the inbound's bind address
            write_reply(conn, REP_SUCCESS, Some(local_addr)).await?;
            Ok((target, Command::UdpAssociate))
        }
        cmd => {
            write_reply(conn, REP_CMD_NOT_SUPPORTED, None).await?;
            Err(Error::Protocol(format!("unsupported SOCKS5 command: {}", cmd)))
        }
    }
}

async fn write_reply<S>(conn: &mut S, rep: u8, bound: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bound = bound.unwrap_or_else(|| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));
    let mut reply = BytesMut::with_capacity(22);
    reply.put_u8(VERSION5);
    reply.put_u8(rep);
    reply.put_u8(0x00);
    reply.put_slice(&Address::socket(bound).to_socks_bytes());
    conn.write_all(&reply).await?;
    conn.flush().await?;
    Ok(())
}

async fn read_addr<S>(conn: &mut S, atyp: u8) -> Result<Address>
where
    S: AsyncRead + Unpin,
{
    match atyp {
        ATYP_IPV4 => {
            let mut raw = [0u8; 6];
            conn.read_exact(&mut raw).await?;
            let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
            let port = u16::from_be_bytes([raw[4], raw[5]]);
            Ok(Address::Socket(SocketAddr::new(ip.into(), port)))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            conn.read_exact(&mut domain).await?;
            let mut port = [0u8; 2];
            conn.read_exact(&mut port).await?;
            Ok(Address::Domain(
                String::from_utf8_lossy(&domain).to_string(),
                u16::from_be_bytes(port),
            ))
        }
        ATYP_IPV6 => {
            let mut raw = [0u8; 18];
            conn.read_exact(&mut raw).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[..16]);
            let port = u16::from_be_bytes([raw[16], raw[17]]);
            Ok(Address::Socket(SocketAddr::new(
                Ipv6Addr::from(octets).into(),
                port,
            )))
        }
        _ => Err(Error::Protocol(format!("unsupported address type: {}", atyp))),
    }
}

async fn read_until_nul<S>(conn: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        conn.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            break;
        }
        if out.len() >= 255 {
            return Err(Error::Protocol("SOCKS4 field too long".into()));
        }
        out.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&out).to_string())
}

// --- UDP ---

/// Create the SOCKS UDP listener: one read task decapsulating SOCKS5 UDP
/// datagrams and emitting packet adapters.
pub async fn new_udp(addr: &str, tx: UdpSender) -> Result<ListenerHandle> {
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
            let Some((target, payload)) = decode_udp_datagram(&buf[..n]) else {
                continue;
            };

            let metadata = Metadata::new(target, InboundKind::Socks5)
                .with_source(Address::socket(source))
                .with_network(Network::Udp);
            let packet = SocksPacket {
                socket: sock.clone(),
                source,
                payload,
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

struct SocksPacket {
    socket: Arc<UdpSocket>,
    source: SocketAddr,
    payload: Bytes,
}

#[async_trait::async_trait]
impl UdpPacket for SocksPacket {
    fn data(&self) -> &Bytes {
        &self.payload
    }

    async fn write_back(&self, data: &[u8], from: &Address) -> io::Result<usize> {
        let packet = encode_udp_datagram(from, data);
        self.socket.send_to(&packet, self.source).await
    }
}

/// Parse a SOCKS5 UDP datagram: RSV(2) FRAG ATYP ADDR PORT DATA.
/// Fragmented datagrams are not supported and are dropped.
fn decode_udp_datagram(buf: &[u8]) -> Option<(Address, Bytes)> {
    if buf.len() < 4 || buf[2] != 0 {
        return None;
    }
    let (target, consumed) = parse_addr(&buf[3..])?;
    Some((target, Bytes::copy_from_slice(&buf[3 + consumed..])))
}

/// Prepend the SOCKS5 UDP header to a reply payload
fn encode_udp_datagram(from: &Address, data: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(data.len() + 22);
    out.put_slice(&[0, 0, 0]);
    out.put_slice(&from.to_socks_bytes());
    out.put_slice(data);
    out.to_vec()
}

/// Parse atyp + address + port from a slice; returns the consumed length
fn parse_addr(buf: &[u8]) -> Option<(Address, usize)> {
    match *buf.first()? {
        ATYP_IPV4 => {
            if buf.len() < 7 {
                return None;
            }
            let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
            let port = u16::from_be_bytes([buf[5], buf[6]]);
            Some((Address::Socket(SocketAddr::new(ip.into(), port)), 7))
        }
        ATYP_DOMAIN => {
            let len = *buf.get(1)? as usize;
            if buf.len() < 2 + len + 2 {
                return None;
            }
            let domain = String::from_utf8_lossy(&buf[2..2 + len]).to_string();
            let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
            Some((Address::Domain(domain, port), 2 + len + 2))
        }
        ATYP_IPV6 => {
            if buf.len() < 19 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[1..17]);
            let port = u16::from_be_bytes([buf[17], buf[18]]);
            Some((
                Address::Socket(SocketAddr::new(Ipv6Addr::from(octets).into(), port)),
                19,
            ))
        }
        _ => None,
    }
}
