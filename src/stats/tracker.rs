//! Flow trackers - byte-metering wrappers around proxied connections
//!
//! Every established flow is wrapped in a tracker that forwards I/O to the
//! underlying connection while counting bytes, and registers itself with the
//! statistics manager for live inspection.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use uuid::Uuid;

use crate::common::{Address, Metadata, Stream};

use super::manager::Manager;

/// Ordered list of outbound proxies a flow traversed
pub type Chain = Vec<String>;

/// Routing-policy object consumed by trackers; only its type name and
/// payload string are recorded.
pub trait Rule: Send + Sync {
    fn kind(&self) -> &str;
    fn payload(&self) -> &str;
}

fn serialize_counter<S: Serializer>(v: &AtomicU64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(v.load(Ordering::Relaxed))
}

/// Immutable record of one live flow, plus its two byte counters
#[derive(Serialize)]
pub struct FlowInfo {
    pub id: Uuid,
    pub metadata: Metadata,
    #[serde(serialize_with = "serialize_counter")]
    pub upload: AtomicU64,
    #[serde(serialize_with = "serialize_counter")]
    pub download: AtomicU64,
    pub start: DateTime<Utc>,
    #[serde(rename = "chains")]
    pub chain: Chain,
    pub rule: String,
    #[serde(rename = "rulePayload")]
    pub rule_payload: String,
}

impl FlowInfo {
    pub fn new(metadata: Metadata, chain: Chain, rule: Option<&dyn Rule>) -> Self {
        Self {
            id: Uuid::new_v4(),
            metadata,
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
            start: Utc::now(),
            chain,
            rule: rule.map(|r| r.kind().to_string()).unwrap_or_default(),
            rule_payload: rule.map(|r| r.payload().to_string()).unwrap_or_default(),
        }
    }

    pub fn upload_total(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download_total(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }
}

/// Outbound connection annotated with the proxy chain that produced it
pub struct ChainedStream {
    inner: Stream,
    chain: Chain,
}

impl ChainedStream {
    pub fn new(inner: Stream, chain: Chain) -> Self {
        Self { inner, chain }
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }
}

impl AsyncRead for ChainedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChainedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

/// TCP flow tracker.
///
/// Reads count as download, writes as upload; both are recorded after the
/// underlying I/O reports its byte count, and zero-byte I/O is not counted.
pub struct TcpTracker {
    inner: ChainedStream,
    info: Arc<FlowInfo>,
    manager: Arc<Manager>,
}

impl TcpTracker {
    pub fn new(
        conn: ChainedStream,
        manager: Arc<Manager>,
        metadata: Metadata,
        rule: Option<&dyn Rule>,
    ) -> Self {
        let info = Arc::new(FlowInfo::new(metadata, conn.chain().clone(), rule));
        manager.join(info.clone());
        Self {
            inner: conn,
            info,
            manager,
        }
    }

    pub fn id(&self) -> String {
        self.info.id.to_string()
    }

    pub fn info(&self) -> Arc<FlowInfo> {
        self.info.clone()
    }

    /// Deregister from the manager, then close the underlying connection.
    pub async fn close(mut self) -> io::Result<()> {
        self.manager.leave(self.info.id);
        self.inner.shutdown().await
    }
}

impl Drop for TcpTracker {
    fn drop(&mut self) {
        self.manager.leave(self.info.id);
    }
}

impl AsyncRead for TcpTracker {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = (buf.filled().len() - before) as u64;
            if n > 0 {
                self.info.download.fetch_add(n, Ordering::Relaxed);
                self.manager.push_downloaded(n);
            }
        }
        result
    }
}

impl AsyncWrite for TcpTracker {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            if n > 0 {
                self.info.upload.fetch_add(n as u64, Ordering::Relaxed);
                self.manager.push_uploaded(n as u64);
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Outbound packet socket as seen by the UDP tracker
#[async_trait]
pub trait OutboundDatagram: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    async fn send_to(&self, buf: &[u8], target: &Address) -> io::Result<usize>;
    fn chain(&self) -> Chain;
}

/// UDP flow tracker; same accounting discipline as TCP over a packet socket.
pub struct UdpTracker {
    inner: Box<dyn OutboundDatagram>,
    info: Arc<FlowInfo>,
    manager: Arc<Manager>,
}

impl UdpTracker {
    pub fn new(
        conn: Box<dyn OutboundDatagram>,
        manager: Arc<Manager>,
        metadata: Metadata,
        rule: Option<&dyn Rule>,
    ) -> Self {
        let info = Arc::new(FlowInfo::new(metadata, conn.chain(), rule));
        manager.join(info.clone());
        Self {
            inner: conn,
            info,
            manager,
        }
    }

    pub fn id(&self) -> String {
        self.info.id.to_string()
    }

    pub fn info(&self) -> Arc<FlowInfo> {
        self.info.clone()
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, addr) = self.inner.recv_from(buf).await?;
        if n > 0 {
            self.info.download.fetch_add(n as u64, Ordering::Relaxed);
            self.manager.push_downloaded(n as u64);
        }
        Ok((n, addr))
    }

    pub async fn send_to(&self, buf: &[u8], target: &Address) -> io::Result<usize> {
        let n = self.inner.send_to(buf, target).await?;
        if n > 0 {
            self.info.upload.fetch_add(n as u64, Ordering::Relaxed);
            self.manager.push_uploaded(n as u64);
        }
        Ok(n)
    }

    pub fn close(self) {
        self.manager.leave(self.info.id);
    }
}

impl Drop for UdpTracker {
    fn drop(&mut self) {
        self.manager.leave(self.info.id);
    }
}
