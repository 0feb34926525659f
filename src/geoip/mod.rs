//! GeoIP module - country lookups for the resolver's fallback policy
//!
//! A country → CIDR table loaded from a V2Ray-format geoip.dat. Only what
//! the DNS fallback filter consumes lives here: prefix containment and a
//! reverse country lookup.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use geosite_rs::decode_geoip;
use tracing::debug;

use crate::error::{Error, Result};

/// An IP network in prefix form.
///
/// Both families are stored in a common 128-bit space, with a flag keeping
/// them apart: a v4 address never matches a v6 block or vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrBlock {
    net: u128,
    prefix: u8,
    v4: bool,
}

fn ip_bits(ip: IpAddr) -> (u128, bool) {
    match ip {
        IpAddr::V4(v4) => (u128::from(u32::from(v4)), true),
        IpAddr::V6(v6) => (u128::from(v6), false),
    }
}

impl CidrBlock {
    fn from_parts(ip: IpAddr, prefix: u8) -> Self {
        let (net, v4) = ip_bits(ip);
        Self { net, prefix, v4 }
    }

    fn width(&self) -> u8 {
        if self.v4 {
            32
        } else {
            128
        }
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        let (bits, v4) = ip_bits(addr);
        if v4 != self.v4 {
            return false;
        }
        if self.prefix == 0 {
            return true;
        }
        let shift = u32::from(self.width() - self.prefix.min(self.width()));
        bits >> shift == self.net >> shift
    }
}

impl FromStr for CidrBlock {
    type Err = Error;

    /// Parse "10.0.0.0/8" form; a bare IP gets a host-length prefix.
    fn from_str(s: &str) -> Result<Self> {
        let (ip_part, prefix_part) = match s.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (s, None),
        };
        let ip: IpAddr = ip_part
            .parse()
            .map_err(|_| Error::InvalidAddress(s.to_string()))?;
        let width = if ip.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= width)
                .ok_or_else(|| Error::InvalidAddress(s.to_string()))?,
            None => width,
        };
        Ok(Self::from_parts(ip, prefix))
    }
}

/// Country → CIDR table resolved against by the geo fallback filter
#[derive(Clone, Default)]
pub struct GeoIpMatcher {
    countries: HashMap<String, Vec<CidrBlock>>,
}

impl GeoIpMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a V2Ray geoip.dat file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let list = decode_geoip(&data)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?;

        let mut matcher = Self::default();
        for entry in &list.entry {
            let blocks = entry
                .cidr
                .iter()
                .filter_map(|cidr| {
                    let ip = match cidr.ip.len() {
                        4 => IpAddr::from(<[u8; 4]>::try_from(cidr.ip.as_slice()).ok()?),
                        16 => IpAddr::from(<[u8; 16]>::try_from(cidr.ip.as_slice()).ok()?),
                        _ => return None,
                    };
                    Some(CidrBlock::from_parts(ip, cidr.prefix as u8))
                })
                .collect();
            matcher.insert(&entry.country_code, blocks);
        }

        debug!(
            "loaded {} countries from {}",
            matcher.countries.len(),
            path.display()
        );
        Ok(matcher)
    }

    /// Insert a country's CIDR list directly (tests, hand-fed tables)
    pub fn insert(&mut self, country_code: &str, cidrs: Vec<CidrBlock>) {
        self.countries.insert(country_code.to_uppercase(), cidrs);
    }

    /// Get the country code for an IP address
    pub fn lookup(&self, ip: IpAddr) -> Option<&str> {
        for (country, cidrs) in &self.countries {
            if cidrs.iter().any(|cidr| cidr.contains(ip)) {
                return Some(country);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse() {
        let cidr: CidrBlock = "192.168.0.0/16".parse().unwrap();
        assert!(cidr.contains("192.168.1.1".parse().unwrap()));
        assert!(!cidr.contains("192.169.0.1".parse().unwrap()));

        let host: CidrBlock = "10.0.0.1".parse().unwrap();
        assert!(host.contains("10.0.0.1".parse().unwrap()));
        assert!(!host.contains("10.0.0.2".parse().unwrap()));

        assert!("300.0.0.0/8".parse::<CidrBlock>().is_err());
        assert!("10.0.0.0/33".parse::<CidrBlock>().is_err());
    }

    #[test]
    fn test_cidr_zero_prefix() {
        let all_v4: CidrBlock = "0.0.0.0/0".parse().unwrap();
        assert!(all_v4.contains("203.0.113.9".parse().unwrap()));
        assert!(!all_v4.contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_cidr_contains_v6() {
        let cidr: CidrBlock = "2001:db8::/32".parse().unwrap();
        assert!(cidr.contains("2001:db8:1234::1".parse().unwrap()));
        assert!(!cidr.contains("2001:db9::1".parse().unwrap()));
        assert!(!cidr.contains("1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn test_lookup() {
        let mut matcher = GeoIpMatcher::new();
        matcher.insert("cn", vec!["223.5.5.0/24".parse().unwrap()]);
        assert_eq!(matcher.lookup("223.5.5.5".parse().unwrap()), Some("CN"));
        assert_eq!(matcher.lookup("8.8.8.8".parse().unwrap()), None);
    }
}
