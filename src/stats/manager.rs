//! Statistics manager - membership and global rate accounting for live flows

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use super::metrics::{FLOWS_ACTIVE, TRAFFIC_DOWNLOAD_BYTES, TRAFFIC_UPLOAD_BYTES};
use super::tracker::FlowInfo;

/// Owns the set of live flows plus the global byte accounting.
///
/// Flow counters live in the flows themselves; the manager keeps global
/// totals and an instantaneous per-second rate published by a ticker task.
#[derive(Default)]
pub struct Manager {
    connections: RwLock<HashMap<Uuid, Arc<FlowInfo>>>,

    upload_temp: AtomicU64,
    download_temp: AtomicU64,
    upload_blip: AtomicU64,
    download_blip: AtomicU64,
    upload_total: AtomicU64,
    download_total: AtomicU64,
}

/// Point-in-time view of the manager
#[derive(Serialize)]
pub struct Snapshot {
    #[serde(rename = "uploadTotal")]
    pub upload_total: u64,
    #[serde(rename = "downloadTotal")]
    pub download_total: u64,
    pub connections: Vec<Arc<FlowInfo>>,
}

impl Manager {
    pub fn new() -> Arc<Self> {
        super::metrics::init_metrics();
        Arc::new(Self::default())
    }

    /// Register a flow. Called from tracker construction.
    pub fn join(&self, flow: Arc<FlowInfo>) {
        self.connections.write().insert(flow.id, flow);
        FLOWS_ACTIVE.inc();
    }

    /// Deregister a flow. A repeat leave of the same flow is a no-op.
    pub fn leave(&self, id: Uuid) {
        if self.connections.write().remove(&id).is_some() {
            FLOWS_ACTIVE.dec();
        }
    }

    /// Record bytes already written to an outbound
    pub fn push_uploaded(&self, n: u64) {
        self.upload_temp.fetch_add(n, Ordering::Relaxed);
        self.upload_total.fetch_add(n, Ordering::Relaxed);
        TRAFFIC_UPLOAD_BYTES.inc_by(n);
    }

    /// Record bytes already read from an outbound
    pub fn push_downloaded(&self, n: u64) {
        self.download_temp.fetch_add(n, Ordering::Relaxed);
        self.download_total.fetch_add(n, Ordering::Relaxed);
        TRAFFIC_DOWNLOAD_BYTES.inc_by(n);
    }

    /// Instantaneous rates in bytes/second, as of the last tick
    pub fn rates(&self) -> (u64, u64) {
        (
            self.upload_blip.load(Ordering::Relaxed),
            self.download_blip.load(Ordering::Relaxed),
        )
    }

    pub fn snapshot(&self) -> Snapshot {
        let connections = self.connections.read().values().cloned().collect();
        Snapshot {
            upload_total: self.upload_total.load(Ordering::Relaxed),
            download_total: self.download_total.load(Ordering::Relaxed),
            connections,
        }
    }

    pub fn has_flow(&self, id: Uuid) -> bool {
        self.connections.read().contains_key(&id)
    }

    fn tick(&self) {
        self.upload_blip
            .store(self.upload_temp.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        self.download_blip.store(
            self.download_temp.swap(0, Ordering::Relaxed),
            Ordering::Relaxed,
        );
    }

    /// Rate-publication loop; spawn once next to the ingress consumer.
    pub async fn run_ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            self.tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, InboundKind, Metadata};

    fn flow() -> Arc<FlowInfo> {
        Arc::new(FlowInfo::new(
            Metadata::new(Address::domain("example.com", 443), InboundKind::Socks5),
            vec!["DIRECT".into()],
            None,
        ))
    }

    #[test]
    fn test_join_leave_membership() {
        let manager = Manager::new();
        let f = flow();
        let id = f.id;

        assert!(!manager.has_flow(id));
        manager.join(f);
        assert!(manager.has_flow(id));
        assert_eq!(manager.snapshot().connections.len(), 1);

        manager.leave(id);
        assert!(!manager.has_flow(id));
        // second leave is a no-op
        manager.leave(id);
        assert!(manager.snapshot().connections.is_empty());
    }

    #[test]
    fn test_totals_accumulate() {
        let manager = Manager::new();
        manager.push_uploaded(100);
        manager.push_uploaded(20);
        manager.push_downloaded(50);

        let snap = manager.snapshot();
        assert_eq!(snap.upload_total, 120);
        assert_eq!(snap.download_total, 50);

        // a tick publishes the accumulated rate and clears the window
        manager.tick();
        assert_eq!(manager.rates(), (120, 50));
        manager.tick();
        assert_eq!(manager.rates(), (0, 0));
        assert_eq!(manager.snapshot().upload_total, 120);
    }

    #[test]
    fn test_snapshot_serializes() {
        let manager = Manager::new();
        manager.join(flow());
        let v = serde_json::to_value(manager.snapshot()).unwrap();
        assert!(v["uploadTotal"].is_u64());
        assert_eq!(v["connections"].as_array().unwrap().len(), 1);
    }
}
