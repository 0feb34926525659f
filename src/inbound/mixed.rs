//! Mixed inbound: SOCKS and HTTP on one port, split by first-byte sniffing.
//!
//! The peek leaves the byte in place, so whichever handshake wins continues
//! from the same buffer.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::Authenticator;
use crate::common::peek_one;
use crate::error::Result;

use super::{apply_keepalive, http, socks, ListenerHandle, TcpSender};

/// Create the mixed listener
pub async fn new(addr: &str, tx: TcpSender, auth: Arc<Authenticator>) -> Result<ListenerHandle> {
    ListenerHandle::new_tcp(addr, move |stream, source| {
        let tx = tx.clone();
        let auth = auth.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_mixed(stream, source, auth, tx).await {
                debug!("mixed connection from {} failed: {}", source, e);
            }
        });
    })
    .await
}

async fn handle_mixed(
    stream: TcpStream,
    source: SocketAddr,
    auth: Arc<Authenticator>,
    tx: TcpSender,
) -> Result<()> {
    apply_keepalive(&stream);
    let local_addr = stream.local_addr()?;
    let mut buffed = BufReader::new(stream);

    match peek_one(&mut buffed).await? {
        Some(socks::VERSION4) => socks::handle_socks4(buffed, source, auth, tx).await,
        Some(socks::VERSION5) => socks::handle_socks5(buffed, source, local_addr, auth, tx).await,
        Some(_) => http::handle_http(buffed, source, auth, tx).await,
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, InboundKind};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn mixed_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_sniffs_http() {
        let (tx, mut rx) = mpsc::channel(1);
        let (mut client, server) = mixed_pair().await;
        let source = client.local_addr().unwrap();
        tokio::spawn(handle_mixed(
            server,
            source,
            Arc::new(Authenticator::default()),
            tx,
        ));

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let ctx = rx.recv().await.unwrap();
        assert_eq!(ctx.metadata.inbound, InboundKind::Http);
        assert_eq!(ctx.metadata.destination, Address::domain("example.com", 443));
    }

    #[tokio::test]
    async fn test_sniffs_socks5() {
        let (tx, mut rx) = mpsc::channel(1);
        let (mut client, server) = mixed_pair().await;
        let source = client.local_addr().unwrap();
        tokio::spawn(handle_mixed(
            server,
            source,
            Arc::new(Authenticator::default()),
            tx,
        ));

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        // CONNECT 1.2.3.4:80
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        let ctx = rx.recv().await.unwrap();
        assert_eq!(ctx.metadata.inbound, InboundKind::Socks5);
    }
}
