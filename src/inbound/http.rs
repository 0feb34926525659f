//! HTTP inbound
//!
//! Three request shapes on one port:
//! - CONNECT: reply 200 and hand the raw byte stream downstream
//! - plain proxy requests: strip proxy headers, rewrite the request line,
//!   and deliver the pre-read request ahead of the client stream
//! - upgrade requests (Connection: Upgrade): interpose an in-memory pipe so
//!   the upstream response can be inspected before the relay goes raw

use std::net::SocketAddr;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::auth::Authenticator;
use crate::common::{parse_host_port, Address, InboundKind, Metadata, PrependStream, Stream};
use crate::error::{Error, Result};

use super::{apply_keepalive, ConnContext, ListenerHandle, TcpSender};

const RESPONSE_200_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const RESPONSE_407_AUTH_REQUIRED: &[u8] = b"HTTP/1.1 407 Proxy Authentication Required\r\n\
    Proxy-Authenticate: Basic realm=\"proxy\"\r\n\
    Connection: close\r\n\r\n";

/// In-memory pipe capacity for the upgrade path
const UPGRADE_PIPE_SIZE: usize = 32 * 1024;

/// Create the HTTP proxy listener
pub async fn new(addr: &str, tx: TcpSender, auth: Arc<Authenticator>) -> Result<ListenerHandle> {
    ListenerHandle::new_tcp(addr, move |stream, source| {
        let tx = tx.clone();
        let auth = auth.clone();
        tokio::spawn(async move {
            apply_keepalive(&stream);
            if let Err(e) = handle_http(stream, source, auth, tx).await {
                debug!("http connection from {} failed: {}", source, e);
            }
        });
    })
    .await
}

/// Parsed HTTP request head (the body is never consumed here)
struct HttpRequest {
    method: String,
    target: String,
    version: String,
    /// Lowercased names, verbatim values
    headers: Vec<(String, String)>,
}

impl HttpRequest {
    fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Connection header contains the token `Upgrade` (comma-separated,
    /// case-insensitive)
    fn is_upgrade(&self) -> bool {
        self.headers
            .iter()
            .filter(|(k, _)| k == "connection")
            .flat_map(|(_, v)| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    }

    fn host(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == "host")
            .map(|(_, v)| v.as_str())
    }

    fn destination(&self) -> Result<Address> {
        if self.is_connect() {
            return parse_host_port(&self.target, 80);
        }
        if let Some(url) = self.target.strip_prefix("http://") {
            let host_part = url.split('/').next().unwrap_or(url);
            return parse_host_port(host_part, 80);
        }
        if let Some(host) = self.host() {
            return parse_host_port(host, 80);
        }
        Err(Error::Protocol(format!(
            "cannot determine target from: {}",
            self.target
        )))
    }

    /// Path for the rewritten request line (absolute URI stripped)
    fn forward_path(&self) -> &str {
        if let Some(url) = self.target.strip_prefix("http://") {
            if let Some(pos) = url.find('/') {
                return &url[pos..];
            }
            return "/";
        }
        &self.target
    }

    fn auth_header(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == "proxy-authorization")
            .map(|(_, v)| v.as_str())
    }

    /// Reconstruct the request head with proxy-specific headers removed.
    ///
    /// The forward path (`rewrite_path`) also replaces the absolute URI with
    /// a relative one and drops hop-by-hop headers; the upgrade path keeps
    /// Connection/Upgrade intact.
    fn to_bytes(&self, rewrite_path: bool) -> BytesMut {
        const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "te", "trailer"];

        let mut buf = BytesMut::new();

        buf.extend_from_slice(self.method.as_bytes());
        buf.extend_from_slice(b" ");
        if rewrite_path {
            buf.extend_from_slice(self.forward_path().as_bytes());
        } else {
            buf.extend_from_slice(self.target.as_bytes());
        }
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.version.as_bytes());
        buf.extend_from_slice(b"\r\n");

        for (key, value) in &self.headers {
            if key.starts_with("proxy-") {
                continue;
            }
            if rewrite_path && HOP_BY_HOP.contains(&key.as_str()) {
                continue;
            }
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        buf
    }
}

async fn parse_request<S>(reader: &mut BufReader<S>) -> Result<HttpRequest>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
        _ => return Err(Error::Protocol("invalid HTTP request line".into())),
    };

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_lowercase(), value.trim().to_string()));
        }
    }

    Ok(HttpRequest {
        method,
        target,
        version,
        headers,
    })
}

fn check_auth(auth: &Authenticator, header: Option<&str>) -> bool {
    if !auth.enabled() {
        return true;
    }
    let Some(encoded) = header.and_then(|h| h.strip_prefix("Basic ")) else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let decoded = String::from_utf8_lossy(&decoded);
    match decoded.split_once(':') {
        Some((user, pass)) => auth.verify(user, pass),
        None => false,
    }
}

/// Serve one proxied request on an accepted connection
pub(crate) async fn handle_http<S>(
    conn: S,
    source: SocketAddr,
    auth: Arc<Authenticator>,
    tx: TcpSender,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(conn);
    let request = parse_request(&mut reader).await?;

    if !check_auth(&auth, request.auth_header()) {
        let mut conn = reader.into_inner();
        let _ = conn.write_all(RESPONSE_407_AUTH_REQUIRED).await;
        return Err(Error::AuthFailed);
    }

    let destination = request.destination()?;
    let metadata =
        Metadata::new(destination, InboundKind::Http).with_source(Address::socket(source));

    if request.is_connect() {
        let mut conn = unbuffer(reader);
        conn.write_all(RESPONSE_200_ESTABLISHED).await?;
        return super::send_context(&tx, ConnContext::new(metadata, conn)).await;
    }

    if request.is_upgrade() {
        return handle_upgrade(unbuffer(reader), &request, metadata, tx).await;
    }

    // plain proxy request: replay the rewritten head in front of the
    // unread remainder of the client stream
    let head = request.to_bytes(true);
    let stream = PrependStream::new(head, Box::new(reader));
    super::send_context(&tx, ConnContext::new(metadata, Box::new(stream))).await
}

/// Interpose an in-memory pipe between the client and the router.
///
/// The router gets the right end as an ordinary context stream. On the left
/// end we replay the upgrade request, read the upstream's response, strip
/// proxy headers, forward it to the client, and go raw once the upstream
/// answered 101.
async fn handle_upgrade(
    mut conn: Stream,
    request: &HttpRequest,
    metadata: Metadata,
    tx: TcpSender,
) -> Result<()> {
    let (left, right) = tokio::io::duplex(UPGRADE_PIPE_SIZE);

    super::send_context(&tx, ConnContext::new(metadata, Box::new(right))).await?;

    let mut left = BufReader::new(left);
    left.get_mut().write_all(&request.to_bytes(false)).await?;

    let (status, response_head) = read_response_head(&mut left).await?;
    conn.write_all(&response_head).await?;

    if status == 101 {
        let _ = tokio::io::copy_bidirectional(&mut left, &mut conn).await;
    }
    Ok(())
}

/// Unwrap a BufReader without losing bytes the client pipelined behind the
/// request head.
fn unbuffer<S>(reader: BufReader<S>) -> Stream
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let leftover = BytesMut::from(reader.buffer());
    let inner = reader.into_inner();
    if leftover.is_empty() {
        Box::new(inner)
    } else {
        Box::new(PrependStream::new(leftover, Box::new(inner)))
    }
}

/// Read an HTTP response head from the pipe, returning the status code and
/// the head bytes with proxy-specific headers removed.
async fn read_response_head<S>(reader: &mut BufReader<S>) -> Result<(u16, BytesMut)>
where
    S: AsyncRead + Unpin,
{
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::Protocol("invalid HTTP response line".into()))?;

    let mut head = BytesMut::new();
    head.extend_from_slice(status_line.as_bytes());
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        let name = trimmed.split(':').next().unwrap_or("").trim().to_lowercase();
        if name.starts_with("proxy-") {
            continue;
        }
        head.extend_from_slice(line.as_bytes());
    }
    head.extend_from_slice(b"\r\n");
    Ok((status, head))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    fn source() -> SocketAddr {
        "10.0.0.2:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_connect_request() {
        let (tx, mut rx) = mpsc::channel(1);
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(handle_http(
            server,
            source(),
            Arc::new(Authenticator::default()),
            tx,
        ));

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let mut reply = vec![0u8; RESPONSE_200_ESTABLISHED.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 200"));

        let ctx = rx.recv().await.unwrap();
        assert_eq!(ctx.metadata.destination, Address::domain("example.com", 443));
        assert_eq!(ctx.metadata.inbound, InboundKind::Http);
    }

    #[tokio::test]
    async fn test_forward_request_rewritten() {
        let (tx, mut rx) = mpsc::channel(1);
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(handle_http(
            server,
            source(),
            Arc::new(Authenticator::default()),
            tx,
        ));

        client
            .write_all(
                b"GET http://example.com/index.html HTTP/1.1\r\n\
                  Host: example.com\r\n\
                  Proxy-Connection: keep-alive\r\n\
                  Accept: */*\r\n\r\nbody",
            )
            .await
            .unwrap();

        let mut ctx = rx.recv().await.unwrap();
        assert_eq!(ctx.metadata.destination, Address::domain("example.com", 80));

        // the emitted stream replays the rewritten request, then the body
        let mut head = Vec::new();
        let mut buf = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            ctx.stream.read_exact(&mut buf).await.unwrap();
            head.push(buf[0]);
        }
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("GET /index.html HTTP/1.1\r\n"));
        assert!(head.contains("host: example.com\r\n"));
        assert!(!head.to_lowercase().contains("proxy-connection"));

        let mut body = [0u8; 4];
        ctx.stream.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"body");
    }

    #[tokio::test]
    async fn test_auth_rejects_without_credentials() {
        let (tx, mut rx) = mpsc::channel(1);
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(handle_http(
            server,
            source(),
            Arc::new(Authenticator::new(&["alice:secret".into()])),
            tx,
        ));

        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HTTP/1.1 407");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_upgrade_pipeline() {
        let (tx, mut rx) = mpsc::channel(1);
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(handle_http(
            server,
            source(),
            Arc::new(Authenticator::default()),
            tx,
        ));

        client
            .write_all(
                b"GET /ws HTTP/1.1\r\n\
                  Host: h:80\r\n\
                  Connection: Upgrade\r\n\
                  Upgrade: websocket\r\n\r\n",
            )
            .await
            .unwrap();

        // the router side sees the upgrade request on the pipe
        let mut ctx = rx.recv().await.unwrap();
        assert_eq!(ctx.metadata.destination, Address::domain("h", 80));
        let mut head = Vec::new();
        let mut buf = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            ctx.stream.read_exact(&mut buf).await.unwrap();
            head.push(buf[0]);
        }
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(head.contains("upgrade: websocket\r\n"));

        // answer 101 through the pipe; the client must observe it
        ctx.stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\r\n",
            )
            .await
            .unwrap();

        let mut reply = Vec::new();
        while !reply.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut buf).await.unwrap();
            reply.push(buf[0]);
        }
        assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.1 101"));

        // after 101 the relay is transparent in both directions
        ctx.stream.write_all(b"srv->cli").await.unwrap();
        let mut down = [0u8; 8];
        client.read_exact(&mut down).await.unwrap();
        assert_eq!(&down, b"srv->cli");

        client.write_all(b"cli->srv").await.unwrap();
        let mut up = [0u8; 8];
        ctx.stream.read_exact(&mut up).await.unwrap();
        assert_eq!(&up, b"cli->srv");
    }

    #[tokio::test]
    async fn test_upgrade_detection_tokens() {
        let request = HttpRequest {
            method: "GET".into(),
            target: "/".into(),
            version: "HTTP/1.1".into(),
            headers: vec![("connection".into(), "keep-alive, UPGRADE".into())],
        };
        assert!(request.is_upgrade());

        let request = HttpRequest {
            method: "GET".into(),
            target: "/".into(),
            version: "HTTP/1.1".into(),
            headers: vec![("connection".into(), "keep-alive".into())],
        };
        assert!(!request.is_upgrade());
    }
}
