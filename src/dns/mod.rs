//! DNS fallback filters
//!
//! Policy predicates the resolver uses to decide when its primary answer
//! should be overridden by the fallback resolver: an IP answer can be
//! suspect by geography or by CIDR membership, a queried domain can be
//! force-routed to the fallback by pattern.

use std::net::IpAddr;
use std::sync::Arc;

use crate::geoip::{CidrBlock, GeoIpMatcher};

/// Predicate over a resolved IP
pub trait FallbackIpFilter: Send + Sync {
    fn matches(&self, ip: IpAddr) -> bool;
}

/// Predicate over a queried domain
pub trait FallbackDomainFilter: Send + Sync {
    fn matches(&self, domain: &str) -> bool;
}

/// Matches IPs whose looked-up country differs from the expected code.
///
/// Private ranges are exempt: an RFC 1918 / ULA / link-local answer is never
/// treated as a wrong answer.
pub struct GeoIpFilter {
    code: String,
    db: Arc<GeoIpMatcher>,
}

impl GeoIpFilter {
    pub fn new(code: impl Into<String>, db: Arc<GeoIpMatcher>) -> Self {
        Self {
            code: code.into(),
            db,
        }
    }
}

impl FallbackIpFilter for GeoIpFilter {
    fn matches(&self, ip: IpAddr) -> bool {
        // A lookup miss yields an empty code, which never equals a
        // configured country and therefore matches.
        let found = self.db.lookup(ip).unwrap_or("");
        !found.eq_ignore_ascii_case(&self.code) && !is_private(ip)
    }
}

/// Matches IPs inside the configured network
pub struct IpNetFilter {
    net: CidrBlock,
}

impl IpNetFilter {
    pub fn new(net: CidrBlock) -> Self {
        Self { net }
    }
}

impl FallbackIpFilter for IpNetFilter {
    fn matches(&self, ip: IpAddr) -> bool {
        self.net.contains(ip)
    }
}

/// RFC 1918, ULA, and link-local ranges
fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local() || v4.is_loopback(),
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            // fc00::/7 (unique local) and fe80::/10 (link local)
            (seg[0] & 0xfe00) == 0xfc00 || (seg[0] & 0xffc0) == 0xfe80 || v6.is_loopback()
        }
    }
}

#[derive(Debug, Clone)]
enum DomainPattern {
    /// `example.com` - exact match
    Exact(String),
    /// `*.example.com` - exactly one extra label
    Wildcard(String),
    /// `+.example.com` - the domain and any depth of subdomains
    Subtree(String),
}

impl DomainPattern {
    fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim().to_lowercase();
        if let Some(rest) = pattern.strip_prefix("+.") {
            if rest.is_empty() {
                return None;
            }
            return Some(DomainPattern::Subtree(rest.to_string()));
        }
        if let Some(rest) = pattern.strip_prefix("*.") {
            if rest.is_empty() {
                return None;
            }
            return Some(DomainPattern::Wildcard(rest.to_string()));
        }
        if pattern.is_empty() || pattern.contains('*') || pattern.contains('+') {
            return None;
        }
        Some(DomainPattern::Exact(pattern))
    }

    fn matches(&self, domain: &str) -> bool {
        match self {
            DomainPattern::Exact(d) => domain == d,
            DomainPattern::Wildcard(d) => domain
                .strip_suffix(d)
                .and_then(|head| head.strip_suffix('.'))
                .map(|label| !label.is_empty() && !label.contains('.'))
                .unwrap_or(false),
            DomainPattern::Subtree(d) => {
                domain == d
                    || domain
                        .strip_suffix(d)
                        .map(|head| head.ends_with('.'))
                        .unwrap_or(false)
            }
        }
    }
}

/// Matches domains against a fixed pattern set.
///
/// Patterns that fail to parse are dropped silently; validating input is the
/// caller's job.
pub struct DomainFilter {
    patterns: Vec<DomainPattern>,
}

impl DomainFilter {
    pub fn new(domains: &[String]) -> Self {
        let patterns = domains
            .iter()
            .filter_map(|d| DomainPattern::parse(d))
            .collect();
        Self { patterns }
    }
}

impl FallbackDomainFilter for DomainFilter {
    fn matches(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        self.patterns.iter().any(|p| p.matches(&domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo_filter(code: &str) -> GeoIpFilter {
        let mut db = GeoIpMatcher::new();
        db.insert("cn", vec!["223.5.5.0/24".parse().unwrap()]);
        db.insert("us", vec!["8.8.8.0/24".parse().unwrap()]);
        GeoIpFilter::new(code, Arc::new(db))
    }

    #[test]
    fn test_geoip_filter_mismatch() {
        let filter = geo_filter("CN");
        // US address while expecting CN: fallback
        assert!(filter.matches("8.8.8.8".parse().unwrap()));
        // CN address, case-insensitive code comparison: no fallback
        assert!(!filter.matches("223.5.5.5".parse().unwrap()));
        // unknown address: fallback
        assert!(filter.matches("9.9.9.9".parse().unwrap()));
    }

    #[test]
    fn test_geoip_filter_private_exempt() {
        for code in ["CN", "US", "JP"] {
            let filter = geo_filter(code);
            for ip in [
                "10.1.2.3",
                "172.16.0.1",
                "192.168.1.1",
                "169.254.0.1",
                "fd00::1",
                "fe80::1",
            ] {
                assert!(!filter.matches(ip.parse().unwrap()), "{} vs {}", ip, code);
            }
        }
    }

    #[test]
    fn test_ipnet_filter() {
        let filter = IpNetFilter::new("240.0.0.0/4".parse().unwrap());
        assert!(filter.matches("240.0.0.1".parse().unwrap()));
        assert!(!filter.matches("1.1.1.1".parse().unwrap()));
    }

    #[test]
    fn test_domain_filter() {
        let filter = DomainFilter::new(&[
            "example.com".into(),
            "*.one.example.org".into(),
            "+.corp.internal".into(),
            "".into(),
            "bad*pattern".into(),
        ]);

        assert!(filter.matches("example.com"));
        assert!(filter.matches("EXAMPLE.COM"));
        assert!(!filter.matches("sub.example.com"));

        assert!(filter.matches("a.one.example.org"));
        assert!(!filter.matches("one.example.org"));
        assert!(!filter.matches("a.b.one.example.org"));

        assert!(filter.matches("corp.internal"));
        assert!(filter.matches("a.corp.internal"));
        assert!(filter.matches("a.b.corp.internal"));
        assert!(!filter.matches("notcorp.internal"));
    }
}
