//! Strait - ingress and session-tracking core for a multi-protocol forward proxy
//!
//! # Architecture
//!
//! ```text
//! raw socket
//! → inbound dispatcher (SOCKS4/5, HTTP, mixed, redirect, tunnel)
//! → connection context (destination metadata + duplex stream)
//! → ingress channel
//! → dispatcher / router
//! → flow tracker (byte accounting, statistics manager)
//! ```
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Metadata, Address
//! ├── inbound/         # Per-protocol dispatchers and listener handles
//! ├── supervisor.rs    # Reconfigurable listener registry
//! ├── stats/           # Flow trackers + statistics manager
//! ├── dns/             # Resolver fallback filters
//! ├── geoip/           # Country → CIDR database
//! └── app/             # Ingress consumer, stats API
//! ```

pub mod common;
pub mod error;

pub mod auth;
pub mod config;
pub mod inbound;
pub mod supervisor;

pub mod dns;
pub mod geoip;
pub mod stats;

pub mod app;

// Re-exports for convenience
pub use common::{Address, InboundKind, Metadata, Network, Stream};
pub use config::{Config, Inbound, Ports, Tunnel};
pub use error::{Error, Result};
pub use inbound::{ConnContext, PacketAdapter};
pub use stats::{Manager, TcpTracker, UdpTracker};
pub use supervisor::Supervisor;
