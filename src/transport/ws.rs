//! WebSocket dialer over TLS-ECH
//!
//! Dials `wss://host:port/path` through [`dial_tls`](super::tls::dial_tls),
//! presenting the auth token as the sole WebSocket subprotocol. A failure
//! whose error is ECH-tagged triggers one config refresh and a second
//! attempt; anything else fails the dial immediately.

use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_tungstenite::tungstenite::handshake::client::{generate_key, Request};
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::ech::EchState;
use crate::error::{Error, Result};

use super::tls::{dial_tls, is_ech_error, HANDSHAKE_TIMEOUT};

/// Tunnel connection type: WebSocket over TLS-ECH over TCP
pub type WsStream = WebSocketStream<TlsStream<TcpStream>>;

/// Total dial attempts, counting the post-refresh retry
pub const MAX_DIAL_ATTEMPTS: usize = 2;

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Dial the relay WebSocket endpoint.
pub async fn dial_ws(cfg: &ClientConfig, ech: &EchState) -> Result<WsStream> {
    let endpoint = cfg.server_endpoint()?;
    let url = format!("wss://{}:{}{}", endpoint.host, endpoint.port, endpoint.path);

    let endpoint = &endpoint;
    let url = &url;
    retry_on_ech_error(
        move |attempt| {
            Box::pin(async move {
                if attempt > 1 {
                    info!("[tunnel] retrying dial ({}/{})", attempt, MAX_DIAL_ATTEMPTS);
                }
                let ech_list = ech.snapshot()?;
                let tls = dial_tls(cfg.outer_host(), endpoint.port, &endpoint.host, &ech_list)
                    .await?;

                let request = Request::builder()
                    .uri(url.as_str())
                    .header("Host", endpoint.host.as_str())
                    .header("Connection", "Upgrade")
                    .header("Upgrade", "websocket")
                    .header("Sec-WebSocket-Version", "13")
                    .header("Sec-WebSocket-Key", generate_key())
                    .header("Sec-WebSocket-Protocol", cfg.token.as_str())
                    .body(())
                    .map_err(|e| Error::Proxy(format!("failed to build upgrade request: {}", e)))?;

                let (ws, _response) =
                    tokio::time::timeout(HANDSHAKE_TIMEOUT, client_async(request, tls))
                        .await
                        .map_err(|_| Error::Timeout)?
                        .map_err(|e| Error::Proxy(format!("WebSocket handshake failed: {}", e)))?;

                Ok(ws)
            })
        },
        move || Box::pin(async move { ech.refresh(&cfg.ech_domain, &cfg.dns_server).await }),
    )
    .await
}

/// Run `attempt` up to [`MAX_DIAL_ATTEMPTS`] times, invoking `refresh` once
/// between attempts when the failure is ECH-tagged. Non-ECH failures
/// propagate immediately.
pub(crate) async fn retry_on_ech_error<'a, T, A, R>(mut attempt: A, mut refresh: R) -> Result<T>
where
    A: FnMut(usize) -> BoxFuture<'a, Result<T>>,
    R: FnMut() -> BoxFuture<'a, Result<()>>,
{
    let mut last_err = None;

    for n in 1..=MAX_DIAL_ATTEMPTS {
        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(e) if is_ech_error(&e) && n < MAX_DIAL_ATTEMPTS => {
                info!("[ech] dial failed with ECH error, refreshing config: {}", e);
                if let Err(refresh_err) = refresh().await {
                    warn!("[ech] refresh failed: {}", refresh_err);
                }
                tokio::time::sleep(RETRY_DELAY).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| Error::Proxy("dial failed after retries".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_ech_error_refreshes_once_then_succeeds() {
        let attempts = AtomicUsize::new(0);
        let refreshes = AtomicUsize::new(0);

        let result = retry_on_ech_error(
            |_| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    if n == 0 {
                        Err(Error::Tls("server rejected ECH".into()))
                    } else {
                        Ok(42)
                    }
                })
            },
            || {
                refreshes.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_ech_error_fails_without_refresh() {
        let refreshes = AtomicUsize::new(0);

        let result: Result<()> = retry_on_ech_error(
            |_| Box::pin(async { Err(Error::Timeout) }),
            || {
                refreshes.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_capped() {
        let attempts = AtomicUsize::new(0);

        let result: Result<()> = retry_on_ech_error(
            |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err(Error::Ech("still broken".into())) })
            },
            || Box::pin(async { Ok(()) }),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_DIAL_ATTEMPTS);
    }
}
