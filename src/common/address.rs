//! Address type and bind-address helpers

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create an unspecified address (0.0.0.0:0)
    pub fn unspecified() -> Self {
        Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Create from socket address
    pub fn socket(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Serialize to SOCKS wire form: atyp, address, big-endian port.
    ///
    /// Domains carry a one-byte length prefix; IPv4 is 4 raw bytes, IPv6 is 16.
    pub fn to_socks_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            Address::Domain(domain, port) => {
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
            Address::Socket(SocketAddr::V4(v4)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&v4.ip().octets());
                buf.put_u16(v4.port());
            }
            Address::Socket(SocketAddr::V6(v6)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&v6.ip().octets());
                buf.put_u16(v6.port());
            }
        }
        buf.to_vec()
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

/// Parse a `host:port` string into an Address.
///
/// IPv6 hosts may be bracketed. A bare host falls back to `default_port`.
pub fn parse_host_port(s: &str, default_port: u16) -> Result<Address> {
    if let Ok(addr) = s.parse() {
        return Ok(Address::Socket(addr));
    }

    let (host, port) = if let Some((h, p)) = s.rsplit_once(':') {
        let port: u16 = p
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("invalid port in {}", s)))?;
        (h, port)
    } else {
        (s, default_port)
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(Error::InvalidAddress(s.to_string()));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(Address::Socket(SocketAddr::new(ip, port)));
    }
    Ok(Address::Domain(host.to_string(), port))
}

/// Synthesize the bind address for a listener.
///
/// With allow-LAN off, everything binds loopback. With it on, `*` means all
/// interfaces and anything else is taken literally.
pub fn gen_bind_addr(host: &str, port: u16, allow_lan: bool) -> String {
    if allow_lan {
        if host == "*" {
            return format!(":{}", port);
        }
        return format!("{}:{}", host, port);
    }
    format!("127.0.0.1:{}", port)
}

/// Resolve a bind-address string (possibly `:port` form) to a socket address.
pub fn to_socket_addr(addr: &str) -> Result<SocketAddr> {
    let full = if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|_| Error::InvalidAddress(addr.to_string()))
}

/// True when the addr string has a missing or zero port (a disabled entry)
pub fn port_is_zero(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((_, port)) => port.is_empty() || port == "0",
        None => true,
    }
}

/// Port of a bind-address string, 0 when absent or unparseable
pub fn port_of(addr: &str) -> u16 {
    addr.rsplit_once(':')
        .and_then(|(_, p)| p.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("example.com:443", 80).unwrap(),
            Address::Domain("example.com".into(), 443)
        );
        assert_eq!(
            parse_host_port("example.com", 80).unwrap(),
            Address::Domain("example.com".into(), 80)
        );
        assert_eq!(
            parse_host_port("1.2.3.4:53", 80).unwrap(),
            Address::Socket("1.2.3.4:53".parse().unwrap())
        );
        assert_eq!(
            parse_host_port("[::1]:8080", 80).unwrap(),
            Address::Socket("[::1]:8080".parse().unwrap())
        );
        assert!(parse_host_port(":80", 80).is_err());
    }

    #[test]
    fn test_gen_bind_addr() {
        assert_eq!(gen_bind_addr("*", 7890, false), "127.0.0.1:7890");
        assert_eq!(gen_bind_addr("*", 7890, true), ":7890");
        assert_eq!(gen_bind_addr("192.168.1.1", 7890, true), "192.168.1.1:7890");
        assert_eq!(gen_bind_addr("192.168.1.1", 7890, false), "127.0.0.1:7890");
    }

    #[test]
    fn test_to_socket_addr_wildcard() {
        assert_eq!(
            to_socket_addr(":7890").unwrap(),
            "0.0.0.0:7890".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            to_socket_addr("127.0.0.1:7890").unwrap(),
            "127.0.0.1:7890".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_port_helpers() {
        assert!(port_is_zero("127.0.0.1:0"));
        assert!(port_is_zero("127.0.0.1:"));
        assert!(port_is_zero("127.0.0.1"));
        assert!(!port_is_zero("127.0.0.1:7890"));
        assert_eq!(port_of("127.0.0.1:7890"), 7890);
        assert_eq!(port_of(":7890"), 7890);
        assert_eq!(port_of("bogus"), 0);
    }

    #[test]
    fn test_socks_bytes_domain() {
        let addr = Address::Domain("example.com".into(), 443);
        let raw = addr.to_socks_bytes();
        assert_eq!(raw[0], ATYP_DOMAIN);
        assert_eq!(raw[1] as usize, "example.com".len());
        assert_eq!(&raw[2..13], b"example.com");
        assert_eq!(&raw[13..], &[0x01, 0xbb]);
    }

    #[test]
    fn test_socks_bytes_ipv4() {
        let addr = Address::Socket("1.2.3.4:80".parse().unwrap());
        assert_eq!(addr.to_socks_bytes(), vec![ATYP_IPV4, 1, 2, 3, 4, 0, 80]);
    }

    #[test]
    fn test_socks_bytes_ipv6() {
        let addr = Address::Socket("[::1]:80".parse().unwrap());
        let raw = addr.to_socks_bytes();
        assert_eq!(raw[0], ATYP_IPV6);
        assert_eq!(raw.len(), 1 + 16 + 2);
    }
}
