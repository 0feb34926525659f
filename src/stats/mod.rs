//! Flow tracking and statistics
//!
//! - Manager: membership set of live flows + global byte accounting
//! - Trackers: per-flow byte-metering wrappers (TCP stream / UDP socket)

mod manager;
pub mod metrics;
mod tracker;

pub use manager::{Manager, Snapshot};
pub use tracker::{Chain, ChainedStream, FlowInfo, OutboundDatagram, Rule, TcpTracker, UdpTracker};
