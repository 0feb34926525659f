//! Metadata - the unified context for routing decisions
//!
//! Downstream routing only ever sees Metadata, never the socket itself.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use super::Address;

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl Default for Network {
    fn default() -> Self {
        Network::Tcp
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Protocol family of an ingress endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundKind {
    Http,
    Socks,
    Socks4,
    Socks5,
    Redir,
    Tproxy,
    Mixed,
    Tunnel,
}

impl std::fmt::Display for InboundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InboundKind::Http => "http",
            InboundKind::Socks => "socks",
            InboundKind::Socks4 => "socks4",
            InboundKind::Socks5 => "socks5",
            InboundKind::Redir => "redir",
            InboundKind::Tproxy => "tproxy",
            InboundKind::Mixed => "mixed",
            InboundKind::Tunnel => "tunnel",
        };
        write!(f, "{}", s)
    }
}

/// Metadata extracted from an inbound handshake.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Source address of the connection
    pub source: Address,
    /// Destination address the client wants to reach
    pub destination: Address,
    /// Network type (TCP/UDP)
    pub network: Network,
    /// Which kind of inbound produced this connection
    pub inbound: InboundKind,
    /// Proxy forced by a tunnel mapping, bypassing rule matching
    pub special_proxy: Option<String>,
}

impl Metadata {
    /// Create new metadata with required fields
    pub fn new(destination: Address, inbound: InboundKind) -> Self {
        Self {
            source: Address::unspecified(),
            destination,
            network: Network::Tcp,
            inbound,
            special_proxy: None,
        }
    }

    /// Builder: set source address
    pub fn with_source(mut self, source: Address) -> Self {
        self.source = source;
        self
    }

    /// Builder: set network type
    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    /// Builder: set the forced proxy name
    pub fn with_special_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.special_proxy = Some(proxy.into());
        self
    }
}

impl std::fmt::Display for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} --> {}", self.source, self.destination)
    }
}

impl Serialize for Metadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Metadata", 7)?;
        s.serialize_field("network", &self.network.to_string())?;
        s.serialize_field("type", &self.inbound.to_string())?;
        s.serialize_field("sourceIP", &self.source.host())?;
        s.serialize_field("sourcePort", &self.source.port())?;
        match &self.destination {
            Address::Socket(addr) => {
                s.serialize_field("destinationIP", &addr.ip().to_string())?;
                s.serialize_field("host", "")?;
            }
            Address::Domain(domain, _) => {
                s.serialize_field("destinationIP", "")?;
                s.serialize_field("host", domain)?;
            }
        }
        s.serialize_field("destinationPort", &self.destination.port())?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_json_domain() {
        let meta = Metadata::new(Address::domain("example.com", 443), InboundKind::Socks5)
            .with_source(Address::Socket("10.0.0.2:51000".parse().unwrap()));
        let v: serde_json::Value = serde_json::to_value(&meta).unwrap();
        assert_eq!(v["network"], "tcp");
        assert_eq!(v["type"], "socks5");
        assert_eq!(v["host"], "example.com");
        assert_eq!(v["destinationIP"], "");
        assert_eq!(v["destinationPort"], 443);
        assert_eq!(v["sourceIP"], "10.0.0.2");
    }

    #[test]
    fn test_metadata_json_ip() {
        let meta = Metadata::new(
            Address::Socket("1.1.1.1:53".parse().unwrap()),
            InboundKind::Redir,
        )
        .with_network(Network::Udp);
        let v: serde_json::Value = serde_json::to_value(&meta).unwrap();
        assert_eq!(v["network"], "udp");
        assert_eq!(v["destinationIP"], "1.1.1.1");
        assert_eq!(v["host"], "");
    }
}
