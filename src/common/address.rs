//! Target address for tunnel and direct connections

use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Address a proxied connection wants to reach.
///
/// The wire form is `host:port` with IPv6 literals in brackets, which is also
/// how `Display` renders it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl TargetAddr {
    /// Parse a `host:port` string. IPv6 literals must be bracketed.
    pub fn parse(s: &str) -> Result<Self> {
        Self::parse_inner(s, None)
    }

    /// Parse a `host[:port]` string, defaulting the port when absent.
    pub fn parse_with_default(s: &str, default_port: u16) -> Result<Self> {
        Self::parse_inner(s, Some(default_port))
    }

    fn parse_inner(s: &str, default_port: Option<u16>) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidAddress("empty address".into()));
        }

        // SocketAddr handles both 1.2.3.4:443 and [::1]:22 forms.
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(TargetAddr::Socket(addr));
        }

        // Bare IPv6 literal without a port.
        if let (Some(port), Ok(ip)) = (default_port, s.parse::<std::net::IpAddr>()) {
            return Ok(TargetAddr::Socket(SocketAddr::new(ip, port)));
        }

        if let Some((host, port)) = s.rsplit_once(':') {
            if !host.is_empty() && !host.contains(':') {
                let port: u16 = port
                    .parse()
                    .map_err(|_| Error::InvalidAddress(format!("invalid port in {}", s)))?;
                return Ok(TargetAddr::Domain(host.to_string(), port));
            }
        } else if let Some(port) = default_port {
            return Ok(TargetAddr::Domain(s.to_string(), port));
        }

        Err(Error::InvalidAddress(s.to_string()))
    }

    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        TargetAddr::Domain(domain.into(), port)
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Socket(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Host part without port or brackets. Used as the per-site stats key.
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Socket(addr) => addr.ip().to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    /// IP address, if this target is a literal
    pub fn as_ip(&self) -> Option<std::net::IpAddr> {
        match self {
            TargetAddr::Socket(addr) => Some(addr.ip()),
            TargetAddr::Domain(_, _) => None,
        }
    }
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Socket(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Socket(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let addr = TargetAddr::parse("1.2.3.4:443").unwrap();
        assert_eq!(addr.host(), "1.2.3.4");
        assert_eq!(addr.port(), 443);
        assert!(addr.as_ip().is_some());
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let addr = TargetAddr::parse("[::1]:22").unwrap();
        assert_eq!(addr.host(), "::1");
        assert_eq!(addr.port(), 22);
        assert_eq!(addr.to_string(), "[::1]:22");
    }

    #[test]
    fn test_parse_domain() {
        let addr = TargetAddr::parse("example.com:8080").unwrap();
        assert_eq!(addr, TargetAddr::domain("example.com", 8080));
        assert_eq!(addr.to_string(), "example.com:8080");
    }

    #[test]
    fn test_parse_default_port() {
        let addr = TargetAddr::parse_with_default("example.com", 80).unwrap();
        assert_eq!(addr.port(), 80);
        assert!(TargetAddr::parse("example.com").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TargetAddr::parse("").is_err());
        assert!(TargetAddr::parse(":443").is_err());
        assert!(TargetAddr::parse("host:notaport").is_err());
        // Unbracketed IPv6 with port is ambiguous
        assert!(TargetAddr::parse("::1:22").is_err());
    }
}
