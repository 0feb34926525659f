//! Listener supervisor
//!
//! Owns the set of open ingress endpoints and reconfigures it on demand:
//! the new inbound set is diffed against the live one, stale listeners are
//! closed first, then the missing ones are opened. Flows already dispatched
//! are never touched by a reconfigure.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::auth::Authenticator;
use crate::common::{gen_bind_addr, port_is_zero, port_of, InboundKind};
use crate::config::{Inbound, Ports, Tunnel};
use crate::inbound::{self, ListenerHandle, TcpSender, UdpSender};

pub struct Supervisor {
    allow_lan: AtomicBool,
    bind_address: RwLock<String>,
    auth: Arc<Authenticator>,

    tcp_listeners: RwLock<HashMap<Inbound, ListenerHandle>>,
    udp_listeners: RwLock<HashMap<Inbound, ListenerHandle>>,

    tunnel_tcp: RwLock<HashMap<String, ListenerHandle>>,
    tunnel_udp: RwLock<HashMap<String, ListenerHandle>>,

    /// Serializes inbound reconfigures
    recreate_lock: Mutex<()>,
    /// Serializes tunnel reconfigures; independent of the inbound lock
    tunnel_lock: Mutex<()>,
}

impl Supervisor {
    pub fn new(auth: Arc<Authenticator>) -> Arc<Self> {
        Arc::new(Self {
            allow_lan: AtomicBool::new(false),
            bind_address: RwLock::new("*".to_string()),
            auth,
            tcp_listeners: RwLock::new(HashMap::new()),
            udp_listeners: RwLock::new(HashMap::new()),
            tunnel_tcp: RwLock::new(HashMap::new()),
            tunnel_udp: RwLock::new(HashMap::new()),
            recreate_lock: Mutex::new(()),
            tunnel_lock: Mutex::new(()),
        })
    }

    pub fn allow_lan(&self) -> bool {
        self.allow_lan.load(Ordering::Relaxed)
    }

    pub fn set_allow_lan(&self, allow: bool) {
        self.allow_lan.store(allow, Ordering::Relaxed);
    }

    pub fn bind_address(&self) -> String {
        self.bind_address.read().clone()
    }

    pub fn set_bind_address(&self, host: impl Into<String>) {
        *self.bind_address.write() = host.into();
    }

    /// Replace the free-form inbound set; port-derived listeners are kept.
    pub async fn recreate_inbounds(&self, inbounds: Vec<Inbound>, tcp_tx: TcpSender, udp_tx: UdpSender) {
        let mut new_inbounds = inbounds;
        new_inbounds.extend(
            self.current_inbounds()
                .into_iter()
                .filter(|inbound| inbound.from_ports),
        );
        self.recreate(new_inbounds, tcp_tx, udp_tx).await;
    }

    /// Replace the port-derived listeners; free-form entries are kept.
    /// A port of zero disables its entry.
    pub async fn recreate_ports(&self, ports: Ports, tcp_tx: TcpSender, udp_tx: UdpSender) {
        let mut new_inbounds = self.inbounds();
        self.add_port_inbound(&mut new_inbounds, InboundKind::Http, ports.port);
        self.add_port_inbound(&mut new_inbounds, InboundKind::Socks, ports.socks_port);
        self.add_port_inbound(&mut new_inbounds, InboundKind::Redir, ports.redir_port);
        self.add_port_inbound(&mut new_inbounds, InboundKind::Tproxy, ports.tproxy_port);
        self.add_port_inbound(&mut new_inbounds, InboundKind::Mixed, ports.mixed_port);
        self.recreate(new_inbounds, tcp_tx, udp_tx).await;
    }

    fn add_port_inbound(&self, inbounds: &mut Vec<Inbound>, kind: InboundKind, port: u16) {
        if port != 0 {
            inbounds.push(Inbound {
                kind,
                bind_address: gen_bind_addr(&self.bind_address(), port, self.allow_lan()),
                from_ports: true,
            });
        }
    }

    async fn recreate(&self, new_inbounds: Vec<Inbound>, tcp_tx: TcpSender, udp_tx: UdpSender) {
        let _guard = self.recreate_lock.lock().await;
        let (need_close, need_create) = diff(&self.current_inbounds(), &new_inbounds);
        for inbound in need_close {
            self.close_listener(&inbound);
        }
        for inbound in need_create {
            self.create_listener(inbound, &tcp_tx, &udp_tx).await;
        }
    }

    async fn create_listener(&self, inbound: Inbound, tcp_tx: &TcpSender, udp_tx: &UdpSender) {
        let addr = inbound.bind_address.clone();
        if port_is_zero(&addr) {
            return;
        }

        let tcp = match inbound.kind {
            InboundKind::Http => {
                Some(inbound::http::new(&addr, tcp_tx.clone(), self.auth.clone()).await)
            }
            InboundKind::Socks => {
                Some(inbound::socks::new(&addr, tcp_tx.clone(), self.auth.clone()).await)
            }
            InboundKind::Mixed => {
                Some(inbound::mixed::new(&addr, tcp_tx.clone(), self.auth.clone()).await)
            }
            InboundKind::Redir => Some(inbound::redirect::new_redir(&addr, tcp_tx.clone()).await),
            InboundKind::Tproxy => Some(inbound::redirect::new_tproxy(&addr, tcp_tx.clone()).await),
            _ => None,
        };
        let has_udp = matches!(
            inbound.kind,
            InboundKind::Socks | InboundKind::Mixed | InboundKind::Redir | InboundKind::Tproxy
        );
        if tcp.is_none() && !has_udp {
            error!("inbound type {} is not supported", inbound.kind);
            return;
        }

        if let Some(listener) = tcp {
            match listener {
                Ok(handle) => {
                    self.tcp_listeners.write().insert(inbound.clone(), handle);
                }
                Err(e) => {
                    error!("create addr {} tcp listener error: {}", addr, e);
                    return;
                }
            }
        }

        if has_udp {
            // redir's UDP side is deliberately served by the tproxy backend
            let listener = match inbound.kind {
                InboundKind::Socks | InboundKind::Mixed => {
                    inbound::socks::new_udp(&addr, udp_tx.clone()).await
                }
                _ => inbound::redirect::new_tproxy_udp(&addr, udp_tx.clone()).await,
            };
            match listener {
                Ok(handle) => {
                    self.udp_listeners.write().insert(inbound.clone(), handle);
                }
                Err(e) => {
                    error!("create addr {} udp listener error: {}", addr, e);
                    return;
                }
            }
        }

        info!("inbound {} created successfully", inbound.to_alias());
    }

    fn close_listener(&self, inbound: &Inbound) {
        if let Some(handle) = self.tcp_listeners.write().remove(inbound) {
            handle.close();
        }
        if let Some(handle) = self.udp_listeners.write().remove(inbound) {
            handle.close();
        }
    }

    /// Every live inbound descriptor, port-derived ones included
    fn current_inbounds(&self) -> Vec<Inbound> {
        let tcp = self.tcp_listeners.read();
        let mut inbounds: Vec<Inbound> = tcp.keys().cloned().collect();
        for inbound in self.udp_listeners.read().keys() {
            if !tcp.contains_key(inbound) {
                inbounds.push(inbound.clone());
            }
        }
        inbounds
    }

    /// The free-form inbound listing (port-derived entries are hidden)
    pub fn inbounds(&self) -> Vec<Inbound> {
        self.current_inbounds()
            .into_iter()
            .filter(|inbound| !inbound.from_ports)
            .collect()
    }

    /// The five-port view of the live listeners
    pub fn ports(&self) -> Ports {
        let mut ports = Ports::default();
        for inbound in self.current_inbounds() {
            if !inbound.from_ports {
                continue;
            }
            let port = port_of(&inbound.bind_address);
            match inbound.kind {
                InboundKind::Http => ports.port = port,
                InboundKind::Socks => ports.socks_port = port,
                InboundKind::Redir => ports.redir_port = port,
                InboundKind::Tproxy => ports.tproxy_port = port,
                InboundKind::Mixed => ports.mixed_port = port,
                _ => {}
            }
        }
        ports
    }

    /// Replace the static tunnel set.
    ///
    /// A tunnel's identity is the full (network, address, target, proxy)
    /// tuple; the same triple declared for both networks is two listeners.
    pub async fn recreate_tunnels(&self, tunnels: Vec<Tunnel>, tcp_tx: TcpSender, udp_tx: UdpSender) {
        let _guard = self.tunnel_lock.lock().await;

        let mut old: Vec<TunnelEntry> = Vec::new();
        for key in self.tunnel_tcp.read().keys() {
            old.push(TunnelEntry::from_key("tcp", key));
        }
        for key in self.tunnel_udp.read().keys() {
            old.push(TunnelEntry::from_key("udp", key));
        }

        let new: Vec<TunnelEntry> = tunnels
            .iter()
            .flat_map(|tunnel| {
                tunnel.network.iter().map(|network| TunnelEntry {
                    network: network.clone(),
                    address: tunnel.address.clone(),
                    target: tunnel.target.clone(),
                    proxy: tunnel.proxy.clone(),
                })
            })
            .collect();

        let (need_close, need_create) = diff(&old, &new);

        for entry in need_close {
            let key = entry.key();
            let removed = if entry.network == "tcp" {
                self.tunnel_tcp.write().remove(&key)
            } else {
                self.tunnel_udp.write().remove(&key)
            };
            if let Some(handle) = removed {
                handle.close();
            }
        }

        for entry in need_create {
            let key = entry.key();
            if entry.network == "tcp" {
                match inbound::tunnel::new(&entry.address, &entry.target, &entry.proxy, tcp_tx.clone())
                    .await
                {
                    Ok(handle) => {
                        info!(
                            "tunnel(tcp/{}) proxy {} listening at: {}",
                            entry.target,
                            entry.proxy,
                            handle.address()
                        );
                        self.tunnel_tcp.write().insert(key, handle);
                    }
                    Err(e) => error!("start tunnel {} error: {}", entry.target, e),
                }
            } else {
                match inbound::tunnel::new_udp(
                    &entry.address,
                    &entry.target,
                    &entry.proxy,
                    udp_tx.clone(),
                )
                .await
                {
                    Ok(handle) => {
                        info!(
                            "tunnel(udp/{}) proxy {} listening at: {}",
                            entry.target,
                            entry.proxy,
                            handle.address()
                        );
                        self.tunnel_udp.write().insert(key, handle);
                    }
                    Err(e) => error!("start tunnel {} error: {}", entry.target, e),
                }
            }
        }
    }

    /// Live tunnel keys per network, for introspection
    pub fn tunnel_keys(&self) -> (Vec<String>, Vec<String>) {
        (
            self.tunnel_tcp.read().keys().cloned().collect(),
            self.tunnel_udp.read().keys().cloned().collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TunnelEntry {
    network: String,
    address: String,
    target: String,
    proxy: String,
}

impl TunnelEntry {
    fn key(&self) -> String {
        format!("{}/{}/{}", self.address, self.target, self.proxy)
    }

    fn from_key(network: &str, key: &str) -> Self {
        let mut parts = key.splitn(3, '/');
        Self {
            network: network.to_string(),
            address: parts.next().unwrap_or_default().to_string(),
            target: parts.next().unwrap_or_default().to_string(),
            proxy: parts.next().unwrap_or_default().to_string(),
        }
    }
}

/// Set difference in both directions: (old \ new, new \ old)
fn diff<T: Eq + Hash + Clone>(old: &[T], new: &[T]) -> (Vec<T>, Vec<T>) {
    let old_set: HashSet<&T> = old.iter().collect();
    let new_set: HashSet<&T> = new.iter().collect();
    let need_close = old
        .iter()
        .filter(|item| !new_set.contains(item))
        .cloned()
        .collect();
    let need_create = new
        .iter()
        .filter(|item| !old_set.contains(item))
        .cloned()
        .collect();
    (need_close, need_create)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::ingress_channels;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_diff_both_directions() {
        let old = vec![1, 2, 3];
        let new = vec![2, 3, 4];
        let (close, create) = diff(&old, &new);
        assert_eq!(close, vec![1]);
        assert_eq!(create, vec![4]);
    }

    #[test]
    fn test_diff_same_set_is_noop() {
        let set = vec![
            Inbound::new(InboundKind::Http, "127.0.0.1:7890"),
            Inbound::new(InboundKind::Socks, "127.0.0.1:7891"),
        ];
        let (close, create) = diff(&set, &set.clone());
        assert!(close.is_empty());
        assert!(create.is_empty());
    }

    #[tokio::test]
    async fn test_ports_synthesis_two_listeners() {
        let ((tcp_tx, _tcp_rx), (udp_tx, _udp_rx)) = ingress_channels();
        let supervisor = Supervisor::new(Arc::new(Authenticator::default()));

        let http_port = free_port().await;
        let mixed_port = free_port().await;
        let ports = Ports {
            port: http_port,
            mixed_port,
            ..Default::default()
        };
        supervisor.recreate_ports(ports, tcp_tx, udp_tx).await;

        // both come from the port config, so the inbound listing is empty
        assert!(supervisor.inbounds().is_empty());
        assert_eq!(supervisor.ports(), ports);
        assert_eq!(supervisor.tcp_listeners.read().len(), 2);

        // both ports accept connections
        TcpStream::connect(("127.0.0.1", http_port)).await.unwrap();
        TcpStream::connect(("127.0.0.1", mixed_port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconfigure_shrink_keeps_inflight() {
        let ((tcp_tx, mut tcp_rx), (udp_tx, _udp_rx)) = ingress_channels();
        let supervisor = Supervisor::new(Arc::new(Authenticator::default()));

        let http_port = free_port().await;
        let socks_port = free_port().await;
        supervisor
            .recreate_ports(
                Ports {
                    port: http_port,
                    socks_port,
                    ..Default::default()
                },
                tcp_tx.clone(),
                udp_tx.clone(),
            )
            .await;

        // establish a SOCKS5 flow before shrinking
        let mut client = TcpStream::connect(("127.0.0.1", socks_port)).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        let mut ctx = tcp_rx.recv().await.unwrap();

        // drop the SOCKS port
        supervisor
            .recreate_ports(
                Ports {
                    port: http_port,
                    ..Default::default()
                },
                tcp_tx.clone(),
                udp_tx.clone(),
            )
            .await;
        assert_eq!(supervisor.ports().socks_port, 0);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(TcpStream::connect(("127.0.0.1", socks_port)).await.is_err());

        // the in-flight flow still exchanges bytes
        ctx.stream.write_all(b"still here").await.unwrap();
        let mut out = [0u8; 10];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"still here");

        // the untouched HTTP port kept serving
        TcpStream::connect(("127.0.0.1", http_port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_free_form_inbounds_kept_across_ports_reconfigure() {
        let ((tcp_tx, _tcp_rx), (udp_tx, _udp_rx)) = ingress_channels();
        let supervisor = Supervisor::new(Arc::new(Authenticator::default()));

        let socks_port = free_port().await;
        let inbound = Inbound::new(InboundKind::Socks, format!("127.0.0.1:{}", socks_port));
        supervisor
            .recreate_inbounds(vec![inbound.clone()], tcp_tx.clone(), udp_tx.clone())
            .await;
        assert_eq!(supervisor.inbounds(), vec![inbound.clone()]);

        let http_port = free_port().await;
        supervisor
            .recreate_ports(
                Ports {
                    port: http_port,
                    ..Default::default()
                },
                tcp_tx.clone(),
                udp_tx.clone(),
            )
            .await;

        // the free-form entry survived, the port entry is hidden from it
        assert_eq!(supervisor.inbounds(), vec![inbound]);
        assert_eq!(supervisor.ports().port, http_port);
        TcpStream::connect(("127.0.0.1", socks_port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_port_disables_entry() {
        let ((tcp_tx, _tcp_rx), (udp_tx, _udp_rx)) = ingress_channels();
        let supervisor = Supervisor::new(Arc::new(Authenticator::default()));

        supervisor
            .recreate_inbounds(
                vec![Inbound::new(InboundKind::Http, "127.0.0.1:0")],
                tcp_tx,
                udp_tx,
            )
            .await;
        assert!(supervisor.tcp_listeners.read().is_empty());
    }

    #[tokio::test]
    async fn test_tunnel_reconfigure() {
        let ((tcp_tx, _tcp_rx), (udp_tx, _udp_rx)) = ingress_channels();
        let supervisor = Supervisor::new(Arc::new(Authenticator::default()));

        let port = free_port().await;
        let tunnel = Tunnel {
            network: vec!["tcp".into(), "udp".into()],
            address: format!("127.0.0.1:{}", port),
            target: "1.1.1.1:53".into(),
            proxy: "DIRECT".into(),
        };
        supervisor
            .recreate_tunnels(vec![tunnel.clone()], tcp_tx.clone(), udp_tx.clone())
            .await;

        let (tcp_keys, udp_keys) = supervisor.tunnel_keys();
        assert_eq!(tcp_keys, vec![tunnel.key()]);
        assert_eq!(udp_keys, vec![tunnel.key()]);

        // a same-arg reconfigure is a no-op; an empty one closes everything
        supervisor
            .recreate_tunnels(vec![tunnel], tcp_tx.clone(), udp_tx.clone())
            .await;
        assert_eq!(supervisor.tunnel_keys().0.len(), 1);

        supervisor.recreate_tunnels(Vec::new(), tcp_tx, udp_tx).await;
        let (tcp_keys, udp_keys) = supervisor.tunnel_keys();
        assert!(tcp_keys.is_empty());
        assert!(udp_keys.is_empty());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}
