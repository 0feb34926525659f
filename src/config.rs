//! Configuration module for Strait
//!
//! JSON surface mirroring the classic five-port proxy layout plus free-form
//! inbound and tunnel lists.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::InboundKind;
use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// HTTP proxy port (0 = disabled)
    #[serde(default)]
    pub port: u16,

    /// SOCKS proxy port
    #[serde(default)]
    pub socks_port: u16,

    /// Transparent-redirect port
    #[serde(default)]
    pub redir_port: u16,

    /// TPROXY port
    #[serde(default)]
    pub tproxy_port: u16,

    /// Mixed (SOCKS + HTTP) port
    #[serde(default)]
    pub mixed_port: u16,

    /// Accept connections from the LAN, not only loopback
    #[serde(default)]
    pub allow_lan: bool,

    /// Bind host used with allow-lan (`*` = all interfaces)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// `user:pass` entries accepted by SOCKS and HTTP inbounds
    #[serde(default)]
    pub authentication: Vec<String>,

    /// Free-form inbound list
    #[serde(default)]
    pub inbounds: Vec<Inbound>,

    /// Static tunnels
    #[serde(default)]
    pub tunnels: Vec<Tunnel>,

    /// Stats API listen address (e.g., "127.0.0.1:9090")
    #[serde(default)]
    pub api: Option<ApiConfig>,
}

fn default_bind_address() -> String {
    "*".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 0,
            socks_port: 0,
            redir_port: 0,
            tproxy_port: 0,
            mixed_port: 7890,
            allow_lan: false,
            bind_address: default_bind_address(),
            authentication: Vec::new(),
            inbounds: Vec::new(),
            tunnels: Vec::new(),
            api: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// The five-port view of this config
    pub fn ports(&self) -> Ports {
        Ports {
            port: self.port,
            socks_port: self.socks_port,
            redir_port: self.redir_port,
            tproxy_port: self.tproxy_port,
            mixed_port: self.mixed_port,
        }
    }
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Listen address for the stats API
    pub listen: String,
}

/// A configured ingress endpoint: protocol kind plus bind address.
///
/// Used as a map key in the listener supervisor; equality is structural over
/// all fields, so two descriptors naming the same port with different kinds
/// are distinct listeners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Inbound {
    #[serde(rename = "type")]
    pub kind: InboundKind,

    #[serde(rename = "bind-address")]
    pub bind_address: String,

    /// Set on entries synthesized from the five-port config; those are
    /// managed by `recreate_ports` and hidden from the inbound listing.
    #[serde(skip)]
    pub from_ports: bool,
}

impl Inbound {
    pub fn new(kind: InboundKind, bind_address: impl Into<String>) -> Self {
        Self {
            kind,
            bind_address: bind_address.into(),
            from_ports: false,
        }
    }

    pub fn to_alias(&self) -> String {
        format!("{}:{}", self.kind, self.bind_address)
    }
}

/// Five-port convenience configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Ports {
    #[serde(rename = "port")]
    pub port: u16,
    pub socks_port: u16,
    pub redir_port: u16,
    pub tproxy_port: u16,
    pub mixed_port: u16,
}

/// A static addr → target mapping served through a fixed proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    /// Networks to listen on, any of "tcp" / "udp"
    pub network: Vec<String>,
    /// Local bind address
    pub address: String,
    /// Destination forwarded to
    pub target: String,
    /// Proxy the flow is pinned to
    pub proxy: String,
}

impl Tunnel {
    /// Registry key for one network's listener of this tunnel
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.address, self.target, self.proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let cfg = Config::from_json(
            r#"{
                "port": 8080,
                "socks-port": 1080,
                "mixed-port": 7890,
                "allow-lan": true,
                "bind-address": "*",
                "authentication": ["user:pass"],
                "inbounds": [
                    {"type": "socks", "bind-address": "127.0.0.1:9999"}
                ],
                "tunnels": [
                    {"network": ["tcp", "udp"], "address": "127.0.0.1:53", "target": "1.1.1.1:53", "proxy": "DIRECT"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.socks_port, 1080);
        assert!(cfg.allow_lan);
        assert_eq!(cfg.inbounds.len(), 1);
        assert_eq!(cfg.inbounds[0].kind, InboundKind::Socks);
        assert!(!cfg.inbounds[0].from_ports);
        assert_eq!(cfg.tunnels[0].key(), "127.0.0.1:53/1.1.1.1:53/DIRECT");
    }

    #[test]
    fn test_inbound_structural_equality() {
        let a = Inbound::new(InboundKind::Http, "127.0.0.1:7890");
        let b = Inbound::new(InboundKind::Http, "127.0.0.1:7890");
        let c = Inbound::new(InboundKind::Socks, "127.0.0.1:7890");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut d = a.clone();
        d.from_ports = true;
        assert_ne!(a, d);
    }

    #[test]
    fn test_ports_roundtrip() {
        let ports = Ports {
            port: 8080,
            mixed_port: 7890,
            ..Default::default()
        };
        let json = serde_json::to_value(ports).unwrap();
        assert_eq!(json["port"], 8080);
        assert_eq!(json["mixed-port"], 7890);
        assert_eq!(json["socks-port"], 0);
    }
}
