use crate::error::ScanError;
use ipnetwork::Ipv4Network;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::LazyLock;
use tokio::net::lookup_host;

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9\-.]+$").expect("domain pattern is valid")
});

/// A network endpoint to probe.
///
/// `origin` is the token the user supplied (ip, cidr or domain) and is
/// carried unchanged through expansion; `address` is filled in once a
/// concrete IPv4 value is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Host {
    pub address: Option<Ipv4Addr>,
    pub port: u16,
    pub origin: String,
}

impl Host {
    pub fn new(origin: impl Into<String>, port: u16) -> Result<Self, ScanError> {
        let origin = origin.into();
        if origin.trim().is_empty() {
            return Err(ScanError::InvalidTarget("host must not be empty".to_string()));
        }
        Ok(Self {
            address: None,
            port,
            origin,
        })
    }

    /// Returns a new host sharing this origin and port but pointing at `address`.
    pub fn with_address(&self, address: Ipv4Addr) -> Self {
        Self {
            address: Some(address),
            port: self.port,
            origin: self.origin.clone(),
        }
    }

    /// Validate a user supplied token as an IPv4 address, a CIDR block or a domain.
    ///
    /// IPv4 literals carry their own address and CIDR blocks carry their
    /// masked network address; the neighborhood generator still expands the
    /// block from `origin`. Domains are resolved lazily by whichever prober
    /// needs an address.
    pub fn parse(input: &str, port: u16) -> Result<Self, ScanError> {
        let token = input.trim();
        if token.is_empty() {
            return Err(ScanError::InvalidTarget("host must not be empty".to_string()));
        }

        if let Ok(ip) = token.parse::<Ipv4Addr>() {
            log::debug!("[target] parse: token={} kind=ip", token);
            return Ok(Self::new(token, port)?.with_address(ip));
        }

        if let Some(network) = cidr_network(token) {
            log::debug!("[target] parse: token={} kind=cidr network={}", token, network.network());
            return Ok(Self::new(token, port)?.with_address(network.network()));
        }

        if DOMAIN_RE.is_match(token) {
            log::debug!("[target] parse: token={} kind=domain", token);
            return Self::new(token, port);
        }

        Err(ScanError::InvalidTarget(token.to_string()))
    }

    /// True when `origin` is a hostname rather than an address or prefix.
    pub fn is_named(&self) -> bool {
        self.origin.parse::<Ipv4Addr>().is_err() && !is_cidr(&self.origin)
    }

    /// `ip:port` when an address is known, otherwise `origin:port`.
    pub fn host_port(&self) -> String {
        match self.address {
            Some(ip) => format!("{}:{}", ip, self.port),
            None => format!("{}:{}", self.origin, self.port),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(ip) if ip.to_string() != self.origin => {
                write!(f, "{} ({}:{})", self.origin, ip, self.port)
            }
            _ => write!(f, "{}", self.host_port()),
        }
    }
}

/// True when `token` is written as an IPv4 prefix such as `10.0.0.0/24`.
pub fn is_cidr(token: &str) -> bool {
    cidr_network(token).is_some()
}

fn cidr_network(token: &str) -> Option<Ipv4Network> {
    if !token.contains('/') {
        return None;
    }
    token.parse::<Ipv4Network>().ok()
}

/// Forward lookup returning the first IPv4 answer for `origin`.
///
/// Numeric literals short-circuit without touching the resolver.
pub async fn lookup_ipv4(origin: &str) -> Result<Ipv4Addr, ScanError> {
    if let Ok(ip) = origin.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    log::debug!("[target] lookup_ipv4: origin={}", origin);
    let addresses = lookup_host((origin, 0))
        .await
        .map_err(|e| ScanError::resolution(origin, format!("failed to lookup: {}", e)))?;

    let ip = addresses
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| ScanError::resolution(origin, "no lookup ip addresses found"))?;

    log::debug!("[target] lookup_ipv4: origin={} ip={}", origin, ip);
    Ok(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip_address() {
        let host = Host::parse("192.168.1.1", 443).unwrap();
        assert_eq!(host.address, Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(host.origin, "192.168.1.1");
        assert_eq!(host.port, 443);
    }

    #[test]
    fn test_parse_cidr() {
        let host = Host::parse("10.0.0.0/30", 443).unwrap();
        assert_eq!(host.address, Some(Ipv4Addr::new(10, 0, 0, 0)));
        assert_eq!(host.origin, "10.0.0.0/30");
    }

    #[test]
    fn test_parse_cidr_masks_to_network() {
        let host = Host::parse("192.168.7.9/24", 80).unwrap();
        assert_eq!(host.address, Some(Ipv4Addr::new(192, 168, 7, 0)));
        assert_eq!(host.origin, "192.168.7.9/24");
        assert_eq!(host.host_port(), "192.168.7.0:80");
    }

    #[test]
    fn test_is_named() {
        assert!(Host::parse("example.com", 443).unwrap().is_named());
        assert!(!Host::parse("10.0.0.1", 443).unwrap().is_named());
        assert!(!Host::parse("10.0.0.0/30", 443).unwrap().is_named());
    }

    #[test]
    fn test_parse_domain() {
        let host = Host::parse("  example.com ", 8443).unwrap();
        assert_eq!(host.address, None);
        assert_eq!(host.origin, "example.com");
        assert_eq!(host.port, 8443);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(Host::parse("", 443), Err(ScanError::InvalidTarget(_))));
        assert!(matches!(Host::parse("   ", 443), Err(ScanError::InvalidTarget(_))));
        assert!(matches!(Host::parse("exa mple.com", 443), Err(ScanError::InvalidTarget(_))));
        assert!(matches!(Host::parse("https://example.com", 443), Err(ScanError::InvalidTarget(_))));
    }

    #[test]
    fn test_ipv6_is_not_a_target() {
        assert!(Host::parse("2001:db8::1", 443).is_err());
    }

    #[test]
    fn test_with_address_keeps_origin() {
        let host = Host::parse("example.com", 443).unwrap();
        let resolved = host.with_address(Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(resolved.origin, "example.com");
        assert_eq!(resolved.port, 443);
        assert_eq!(resolved.address, Some(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(host.address, None);
    }

    #[test]
    fn test_is_cidr() {
        assert!(is_cidr("192.168.0.0/24"));
        assert!(!is_cidr("192.168.0.1"));
        assert!(!is_cidr("example.com"));
        assert!(!is_cidr("10.0.0.0/40"));
    }

    #[tokio::test]
    async fn test_lookup_ipv4_literal() {
        assert_eq!(lookup_ipv4("127.0.0.1").await.unwrap(), Ipv4Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn test_lookup_ipv4_unresolvable() {
        let err = lookup_ipv4("nonexistent.invalid").await.unwrap_err();
        assert!(matches!(err, ScanError::Resolution { .. }));
    }
}
