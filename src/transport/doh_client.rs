//! In-tunnel DoH client
//!
//! Answers the UDP-ASSOCIATE DNS path: raw DNS queries are POSTed to
//! `cloudflare-dns.com:<relay port>/dns-query` over a connection that uses
//! the same ECH TLS configuration and pinned outer endpoint as the tunnel,
//! so the resolver sees the same outer traffic shape as everything else.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::lookup_host;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

use super::tls::build_tls_config;

const DOH_HOST: &str = "cloudflare-dns.com";
const DOH_TIMEOUT: Duration = Duration::from_secs(10);

/// DoH client bound to one relay port and ECH config snapshot.
pub struct TunnelDohClient {
    client: reqwest::Client,
    url: String,
    port: u16,
}

impl TunnelDohClient {
    /// Build a client for the relay's port, pinning the TCP endpoint to the
    /// configured outer host.
    pub async fn build(cfg: &ClientConfig, ech_list: &[u8]) -> Result<Self> {
        let endpoint = cfg.server_endpoint()?;
        let tls_config = build_tls_config(ech_list)?;

        let mut builder = reqwest::Client::builder()
            .use_preconfigured_tls((*tls_config).clone())
            .timeout(DOH_TIMEOUT)
            .no_proxy();

        // reqwest pins by socket address, so resolve the outer host first.
        let pinned = resolve_outer(cfg.outer_host(), endpoint.port).await?;
        debug!("[doh] pinning {}:{} to {}", DOH_HOST, endpoint.port, pinned);
        builder = builder.resolve(DOH_HOST, pinned);

        let client = builder
            .build()
            .map_err(|e| Error::Dns(format!("failed to build DoH client: {}", e)))?;

        Ok(Self {
            client,
            url: format!("https://{}:{}/dns-query", DOH_HOST, endpoint.port),
            port: endpoint.port,
        })
    }

    /// Relay port this client was built for; a config change invalidates it.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send one raw DNS query, returning the raw DNS response.
    pub async fn query(&self, dns_query: &[u8]) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/dns-message")
            .header("Accept", "application/dns-message")
            .body(dns_query.to_vec())
            .send()
            .await
            .map_err(|e| Error::Dns(format!("DoH request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Dns(format!(
                "DoH server returned {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Dns(format!("failed to read DoH response: {}", e)))?;
        Ok(body.to_vec())
    }
}

async fn resolve_outer(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = lookup_host((host, port))
        .await
        .map_err(|e| Error::Dns(format!("failed to resolve {}: {}", host, e)))?;
    addrs
        .next()
        .ok_or_else(|| Error::Dns(format!("no address for {}", host)))
}
