//! Relay server
//!
//! Terminates the WebSocket side of the tunnel, authenticates via the
//! `Sec-WebSocket-Protocol` token, dials the requested TCP target and pumps
//! bytes both ways. `GET /health` answers 200 for load-balancer checks; any
//! other path requires a WebSocket upgrade.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::TargetAddr;
use crate::error::{Error, Result};

const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const FIRST_FRAME_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// All WS writes (pump output, CLOSE, pings, control replies) serialize
/// through this shared sink.
type SharedSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

#[derive(Clone)]
pub struct RelayConfig {
    /// Expected subprotocol token; empty disables authentication
    pub token: String,
}

pub fn build_router(config: RelayConfig) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(upgrade_handler)
        .with_state(Arc::new(config))
}

/// Bind and serve until ctrl-c.
pub async fn serve(port: u16, token: String) -> Result<()> {
    let app = build_router(RelayConfig { token });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("[relay] listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("[relay] shutting down");
        })
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn upgrade_handler(
    State(config): State<Arc<RelayConfig>>,
    uri: Uri,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(ws) = ws else {
        // Plain HTTP: "/" gets a bland greeting, everything else a 426
        return if uri.path() == "/" {
            "Bad Request".into_response()
        } else {
            (StatusCode::UPGRADE_REQUIRED, "Expected WebSocket").into_response()
        };
    };

    if config.token.is_empty() {
        return ws.on_upgrade(handle_session);
    }

    let presented = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if presented != config.token {
        warn!("[relay] unauthorized upgrade attempt on {}", uri.path());
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    // Echoing the matching protocol doubles as the auth acknowledgement
    ws.protocols([config.token.clone()])
        .on_upgrade(handle_session)
}

async fn handle_session(socket: WebSocket) {
    let (sink, stream) = socket.split();
    let sink: SharedSink = Arc::new(Mutex::new(sink));
    let cancel = CancellationToken::new();

    let ping_task = tokio::spawn(run_ping(sink.clone(), cancel.clone()));

    run_session(sink.clone(), stream, cancel.clone()).await;

    // Teardown is idempotent: the token fans out to the ping task and the
    // target pump, and dropping the halves closes the sockets.
    cancel.cancel();
    let _ = ping_task.await;
    let _ = sink.lock().await.close().await;
    debug!("[relay] session closed");
}

async fn run_ping(sink: SharedSink, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if sink.lock().await.send(Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn run_session(
    sink: SharedSink,
    mut stream: SplitStream<WebSocket>,
    cancel: CancellationToken,
) {
    // Write half of the dialed target; the read half lives in the pump task
    let mut target: Option<OwnedWriteHalf> = None;

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            next = tokio::time::timeout(READ_IDLE_TIMEOUT, stream.next()) => match next {
                Err(_) => {
                    debug!("[relay] read idle timeout");
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(e))) => {
                    debug!("[relay] read error: {}", e);
                    return;
                }
                Ok(Some(Ok(msg))) => msg,
            },
        };

        match msg {
            Message::Text(text) => {
                if let Some(rest) = text.strip_prefix("CONNECT:") {
                    match handle_connect(rest, &sink, &cancel).await {
                        Ok(write_half) => target = Some(write_half),
                        Err(e) => {
                            send_error(&sink, &e.to_string()).await;
                            return;
                        }
                    }
                } else if let Some(payload) = text.strip_prefix("DATA:") {
                    // Legacy text-encoded payload; binary is the normal path
                    if let Some(conn) = target.as_mut() {
                        if conn.write_all(payload.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                } else if text == "CLOSE" {
                    return;
                } else {
                    send_error(&sink, "unknown command").await;
                    return;
                }
            }
            Message::Binary(data) => {
                if let Some(conn) = target.as_mut() {
                    if conn.write_all(&data).await.is_err() {
                        return;
                    }
                }
            }
            // The WS layer answers pings itself; receipt already refreshed
            // the idle deadline above
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => return,
        }
    }
}

/// Dial the CONNECT target, write the inline first frame, acknowledge, and
/// start the remote-to-WS pump.
async fn handle_connect(
    rest: &str,
    sink: &SharedSink,
    cancel: &CancellationToken,
) -> Result<OwnedWriteHalf> {
    let (addr, first_frame) = rest
        .split_once('|')
        .ok_or_else(|| Error::Protocol("invalid CONNECT format".into()))?;

    let target = TargetAddr::parse(addr)?;
    let mut conn = dial_target(&target).await?;

    if !first_frame.is_empty() {
        tokio::time::timeout(
            FIRST_FRAME_WRITE_TIMEOUT,
            conn.write_all(first_frame.as_bytes()),
        )
        .await
        .map_err(|_| Error::Timeout)??;
    }

    info!("[relay] connected to {}", target);
    let (read_half, write_half) = conn.into_split();

    sink.lock()
        .await
        .send(Message::Text("CONNECTED".into()))
        .await
        .map_err(|e| Error::Proxy(format!("failed to send CONNECTED: {}", e)))?;

    tokio::spawn(pump_target_to_ws(read_half, sink.clone(), cancel.clone()));
    Ok(write_half)
}

async fn dial_target(target: &TargetAddr) -> Result<TcpStream> {
    let connect = async {
        match target {
            TargetAddr::Socket(addr) => TcpStream::connect(addr).await,
            TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
        }
    };
    let conn = tokio::time::timeout(DIAL_TIMEOUT, connect)
        .await
        .map_err(|_| Error::Timeout)??;
    conn.set_nodelay(true)?;
    Ok(conn)
}

async fn pump_target_to_ws(mut remote: OwnedReadHalf, sink: SharedSink, cancel: CancellationToken) {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = remote.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        if sink
            .lock()
            .await
            .send(Message::Binary(buf[..n].to_vec()))
            .await
            .is_err()
        {
            break;
        }
    }

    if !cancel.is_cancelled() {
        let _ = sink
            .lock()
            .await
            .send(Message::Text("CLOSE".into()))
            .await;
    }
    cancel.cancel();
}

async fn send_error(sink: &SharedSink, reason: &str) {
    let _ = sink
        .lock()
        .await
        .send(Message::Text(format!("ERROR:{}", reason)))
        .await;
}
