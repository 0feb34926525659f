//! Common types and abstractions
//!
//! This module defines the core types used throughout the application:
//! - Stream: unified async I/O abstraction
//! - Metadata: connection context for routing
//! - Address: network address representation

mod address;
mod metadata;
mod stream;

pub use address::{
    gen_bind_addr, parse_host_port, port_is_zero, port_of, to_socket_addr, Address,
};
pub use metadata::{InboundKind, Metadata, Network};
pub use stream::{peek_one, AsyncReadWrite, PrependStream, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
