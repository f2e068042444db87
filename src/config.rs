//! Client configuration
//!
//! A `ClientConfig` is immutable for one run of the listener; `update_config`
//! swaps the whole value and restarts the service if it was running.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default host the outer TCP connection is pinned to when `-ip` is not
/// given. The TLS SNI stays the logical server host; only the dial endpoint
/// differs.
pub const DEFAULT_OUTER_HOST: &str = "www.visa.com";

/// Routing mode selecting proxy vs direct per target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Everything through the tunnel
    Global,
    /// Mainland-China targets connect directly
    BypassCn,
    /// Everything connects directly
    None,
}

impl RoutingMode {
    /// Parse a mode name; `Err` carries the unrecognized input.
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(RoutingMode::Global),
            "bypass_cn" => Ok(RoutingMode::BypassCn),
            "none" => Ok(RoutingMode::None),
            other => Err(other.to_string()),
        }
    }
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingMode::Global => write!(f, "global"),
            RoutingMode::BypassCn => write!(f, "bypass_cn"),
            RoutingMode::None => write!(f, "none"),
        }
    }
}

/// Proxy client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local listen address, SOCKS5 and HTTP on the same port
    pub listen_addr: String,
    /// Relay endpoint as `host:port[/path]`
    pub server_addr: String,
    /// Pin the outer TCP dial to this host or IP (TLS SNI is unaffected)
    pub server_ip: Option<String>,
    /// Auth token carried as the WebSocket subprotocol
    pub token: String,
    /// Bootstrap DoH server for the ECH lookup
    pub dns_server: String,
    /// Name whose HTTPS record carries the ECH config list
    pub ech_domain: String,
    pub routing_mode: RoutingMode,
    /// Directory for stats snapshots and IP-list files
    pub store_dir: PathBuf,
}

/// Relay endpoint split into its dialing parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ClientConfig {
    /// Split `server_addr` into host, port and websocket path.
    pub fn server_endpoint(&self) -> Result<ServerEndpoint> {
        parse_server_addr(&self.server_addr)
    }

    /// Outer dial host: the pinned IP if set, otherwise the decoy default.
    pub fn outer_host(&self) -> &str {
        match &self.server_ip {
            Some(ip) if !ip.is_empty() => ip,
            _ => DEFAULT_OUTER_HOST,
        }
    }
}

/// Parse `host:port[/path]`, bracketed IPv6 allowed, path defaulting to `/`.
pub fn parse_server_addr(addr: &str) -> Result<ServerEndpoint> {
    let (hostport, path) = match addr.find('/') {
        Some(idx) => (&addr[..idx], addr[idx..].to_string()),
        None => (addr, "/".to_string()),
    };

    let target = crate::common::TargetAddr::parse(hostport)
        .map_err(|_| Error::Config(format!("invalid server address: {}", addr)))?;

    Ok(ServerEndpoint {
        host: target.host(),
        port: target.port(),
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_mode_parse() {
        assert_eq!(RoutingMode::parse("global").unwrap(), RoutingMode::Global);
        assert_eq!(
            RoutingMode::parse("BYPASS_CN").unwrap(),
            RoutingMode::BypassCn
        );
        assert_eq!(RoutingMode::parse("none").unwrap(), RoutingMode::None);
        assert!(RoutingMode::parse("cdn").is_err());
    }

    #[test]
    fn test_parse_server_addr() {
        let ep = parse_server_addr("proxy.workers.dev:443/ws").unwrap();
        assert_eq!(ep.host, "proxy.workers.dev");
        assert_eq!(ep.port, 443);
        assert_eq!(ep.path, "/ws");

        let ep = parse_server_addr("127.0.0.1:3325").unwrap();
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.path, "/");

        assert!(parse_server_addr("no-port").is_err());
    }
}
