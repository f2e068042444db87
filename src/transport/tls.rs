//! TLS dialer with Encrypted Client Hello
//!
//! The outer TCP endpoint and the TLS SNI are decoupled: the socket may
//! target a pinned IP or decoy host while the handshake carries the logical
//! server name, itself hidden inside the encrypted inner hello. ECH is
//! mandatory; a server that rejects it fails the handshake instead of
//! falling back to a cleartext SNI.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::{EchConfig, EchMode};
use rustls::pki_types::{EchConfigListBytes, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::debug;

use crate::error::{Error, Result};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a client config with the given ECH config list applied.
///
/// `with_ech` restricts the connection to TLS 1.3. An empty list is a hard
/// error: the caller must have acquired a config before dialing.
pub fn build_tls_config(ech_list: &[u8]) -> Result<Arc<ClientConfig>> {
    if ech_list.is_empty() {
        return Err(Error::Ech("ECH config list is empty".into()));
    }

    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let ech_bytes = EchConfigListBytes::from(ech_list.to_vec());
    let hpke_suites = rustls::crypto::aws_lc_rs::hpke::ALL_SUPPORTED_SUITES;
    let ech_config = EchConfig::new(ech_bytes, hpke_suites)
        .map_err(|e| Error::Ech(format!("invalid ECH config list: {}", e)))?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_ech(EchMode::Enable(ech_config))
        .map_err(|e| Error::Tls(format!("ECH config error: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Dial `outer_host:port` over TCP and complete a TLS-ECH handshake with
/// `sni` as the logical server name.
pub async fn dial_tls(
    outer_host: &str,
    port: u16,
    sni: &str,
    ech_list: &[u8],
) -> Result<TlsStream<TcpStream>> {
    let config = build_tls_config(ech_list)?;
    let connector = TlsConnector::from(config);

    let server_name = ServerName::try_from(sni.to_string())
        .map_err(|_| Error::InvalidAddress(format!("invalid server name: {}", sni)))?;

    let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((outer_host, port)))
        .await
        .map_err(|_| Error::Timeout)??;
    tcp.set_nodelay(true)?;

    let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::Tls(e.to_string()))?;

    let (_, conn) = tls.get_ref();
    debug!(
        "TLS connected to {}:{} (sni {}, ech {:?})",
        outer_host,
        port,
        sni,
        conn.ech_status()
    );

    Ok(tls)
}

/// Whether a dial failure warrants an ECH config refresh before retrying.
pub fn is_ech_error(err: &Error) -> bool {
    if matches!(err, Error::Ech(_)) {
        return true;
    }
    let msg = err.to_string();
    msg.contains("ECH") || msg.to_ascii_lowercase().contains("encrypted client hello")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ech_list_is_hard_error() {
        assert!(build_tls_config(&[]).is_err());
    }

    #[test]
    fn test_garbage_ech_list_rejected() {
        assert!(build_tls_config(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }

    #[test]
    fn test_ech_error_detection() {
        assert!(is_ech_error(&Error::Ech("not loaded".into())));
        assert!(is_ech_error(&Error::Tls("server rejected ECH".into())));
        assert!(is_ech_error(&Error::Tls(
            "peer sent encrypted client hello retry configs".into()
        )));
        assert!(!is_ech_error(&Error::Tls("certificate expired".into())));
        assert!(!is_ech_error(&Error::Timeout));
        // Substrings of ordinary words must not trigger a refresh
        assert!(!is_ech_error(&Error::Proxy("transport mechanism broken".into())));
    }
}
