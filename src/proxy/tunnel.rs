//! Tunnel session (client side)
//!
//! Establishes the WebSocket leg, exchanges `CONNECT`/`CONNECTED`, then runs
//! an up-pump (client -> WS binary), a down-pump (WS -> client) and a 10 s
//! heartbeat. All WS writes share one async mutex; a single cancellation
//! token tears the three tasks down together, idempotently.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::{PrependStream, TargetAddr};
use crate::error::{Error, Result};
use crate::stats::TrafficStats;
use crate::transport::dial_ws;

use super::{
    direct, send_error_reply, send_success_reply, ProxyMode, SessionCtx, RELAY_BUFFER_SIZE,
};

const PING_INTERVAL: Duration = Duration::from_secs(10);

/// How long to wait for client-first protocol bytes before connecting
/// without a first frame
const FIRST_FRAME_GRACE: Duration = Duration::from_millis(100);

type SharedSink<S> = Arc<Mutex<SplitSink<WebSocketStream<S>, Message>>>;

/// Route the request and run it to completion over the tunnel or directly.
pub(crate) async fn run_session(
    ctx: &Arc<SessionCtx>,
    mut client: PrependStream<TcpStream>,
    target: TargetAddr,
    mode: ProxyMode,
    first_frame: Vec<u8>,
) -> Result<()> {
    let host = target.host();
    ctx.stats.record_connection(&host);

    if ctx.decider.should_bypass(&host).await {
        info!("[route] {} -> direct", target);
        return direct::run_session(ctx, client, target, mode, first_frame).await;
    }

    info!("[route] {} -> tunnel", target);
    let ws = match dial_ws(&ctx.config, &ctx.ech).await {
        Ok(ws) => ws,
        Err(e) => {
            send_error_reply(&mut client, mode).await;
            return Err(e);
        }
    };

    run_tunnel(ctx.stats.clone(), client, ws, &target, mode, first_frame).await
}

async fn run_tunnel<C, S>(
    stats: Arc<TrafficStats>,
    mut client: PrependStream<C>,
    ws: WebSocketStream<S>,
    target: &TargetAddr,
    mode: ProxyMode,
    mut first_frame: Vec<u8>,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let host = target.host();
    let (sink, mut ws_read) = ws.split();
    let sink: SharedSink<S> = Arc::new(Mutex::new(sink));
    let cancel = CancellationToken::new();

    let heartbeat = tokio::spawn(run_heartbeat(sink.clone(), cancel.clone()));

    let established: Result<()> = async {
        // Client-first protocols (TLS says hello immediately) get their
        // opening bytes piggybacked on CONNECT to save a round trip
        if first_frame.is_empty() && mode == ProxyMode::Socks5 {
            let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
            if let Ok(Ok(n)) = tokio::time::timeout(FIRST_FRAME_GRACE, client.read(&mut buf)).await
            {
                if n > 0 {
                    first_frame = buf[..n].to_vec();
                }
            }
        }

        let (connect_msg, trailing) = compose_connect(target, &first_frame);
        {
            let mut sink = sink.lock().await;
            sink.send(Message::Text(connect_msg))
                .await
                .map_err(|e| Error::Proxy(format!("failed to send CONNECT: {}", e)))?;
            if let Some(bytes) = trailing {
                sink.send(Message::Binary(bytes))
                    .await
                    .map_err(|e| Error::Proxy(format!("failed to send first frame: {}", e)))?;
            }
        }
        if !first_frame.is_empty() {
            stats.record_upload(&host, first_frame.len() as u64);
        }

        let reply = await_connect_reply(&mut ws_read).await?;
        if let Some(reason) = reply.strip_prefix("ERROR:") {
            return Err(Error::Proxy(format!("relay refused dial: {}", reason)));
        }
        if reply != "CONNECTED" {
            return Err(Error::Protocol(format!("unexpected relay reply: {}", reply)));
        }
        Ok(())
    }
    .await;

    let result = match established {
        Ok(()) => match send_success_reply(&mut client, mode).await {
            Ok(()) => {
                debug!("[tunnel] {} established", target);
                let (client_read, client_write) = tokio::io::split(client);
                let up = tokio::spawn(up_pump(
                    client_read,
                    sink.clone(),
                    cancel.clone(),
                    stats.clone(),
                    host.clone(),
                ));
                down_pump(&mut ws_read, client_write, &cancel, &stats, &host).await;
                let _ = up.await;
                debug!("[tunnel] {} closed", target);
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
        Err(e) => {
            send_error_reply(&mut client, mode).await;
            Err(e)
        }
    };

    cancel.cancel();
    let _ = heartbeat.await;
    let _ = sink.lock().await.close().await;
    result
}

/// Build the CONNECT frame. First-frame bytes ride inline after the `|`
/// when they are valid UTF-8 (rebuilt HTTP requests always are); raw binary
/// openings are sent as one binary frame right behind the CONNECT instead,
/// which the relay forwards after the dial in arrival order.
fn compose_connect(target: &TargetAddr, first_frame: &[u8]) -> (String, Option<Vec<u8>>) {
    match std::str::from_utf8(first_frame) {
        Ok(text) => (format!("CONNECT:{}|{}", target, text), None),
        Err(_) => (
            format!("CONNECT:{}|", target),
            Some(first_frame.to_vec()),
        ),
    }
}

/// First text frame from the relay decides the session's fate.
async fn await_connect_reply<S>(ws_read: &mut SplitStream<WebSocketStream<S>>) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws_read.next().await {
            None => return Err(Error::Proxy("relay closed before CONNECTED".into())),
            Some(Err(e)) => return Err(Error::Proxy(format!("relay read failed: {}", e))),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(other)) => {
                return Err(Error::Protocol(format!(
                    "unexpected relay frame before CONNECTED: {:?}",
                    other
                )))
            }
        }
    }
}

async fn run_heartbeat<S>(sink: SharedSink<S>, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
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

async fn up_pump<C, S>(
    mut client_read: ReadHalf<PrependStream<C>>,
    sink: SharedSink<S>,
    cancel: CancellationToken,
    stats: Arc<TrafficStats>,
    host: String,
) where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            read = client_read.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    // Orderly teardown: tell the relay, then stop everything
                    let _ = sink.lock().await.send(Message::Text("CLOSE".into())).await;
                    cancel.cancel();
                    return;
                }
                Ok(n) => n,
            },
        };

        stats.record_upload(&host, n as u64);
        if sink
            .lock()
            .await
            .send(Message::Binary(buf[..n].to_vec()))
            .await
            .is_err()
        {
            cancel.cancel();
            return;
        }
    }
}

async fn down_pump<C, S>(
    ws_read: &mut SplitStream<WebSocketStream<S>>,
    mut client_write: WriteHalf<PrependStream<C>>,
    cancel: &CancellationToken,
    stats: &TrafficStats,
    host: &str,
) where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = ws_read.next() => msg,
        };

        match msg {
            Some(Ok(Message::Binary(data))) => {
                stats.record_download(host, data.len() as u64);
                if client_write.write_all(&data).await.is_err() {
                    cancel.cancel();
                    return;
                }
            }
            Some(Ok(Message::Text(text))) if text == "CLOSE" => {
                cancel.cancel();
                return;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_))) => {}
            Some(Ok(Message::Close(_) | Message::Frame(_))) | Some(Err(_)) | None => {
                cancel.cancel();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::TrafficStats;
    use tokio_tungstenite::tungstenite::protocol::Role;

    fn test_stats() -> Arc<TrafficStats> {
        static SEQ: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "echtun-tunnel-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        Arc::new(TrafficStats::new(dir))
    }

    #[test]
    fn test_compose_connect_inline_utf8() {
        let target = TargetAddr::domain("example.com", 443);
        let (msg, trailing) = compose_connect(&target, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(msg, "CONNECT:example.com:443|GET / HTTP/1.1\r\n\r\n");
        assert!(trailing.is_none());
    }

    #[test]
    fn test_compose_connect_splits_binary() {
        let target = TargetAddr::domain("example.com", 443);
        let opening = [0x16, 0x03, 0x01, 0xff, 0x00]; // TLS record header
        let (msg, trailing) = compose_connect(&target, &opening);
        assert_eq!(msg, "CONNECT:example.com:443|");
        assert_eq!(trailing.unwrap(), opening);
    }

    #[test]
    fn test_compose_connect_empty_frame() {
        let target = TargetAddr::parse("[::1]:22").unwrap();
        let (msg, trailing) = compose_connect(&target, b"");
        assert_eq!(msg, "CONNECT:[::1]:22|");
        assert!(trailing.is_none());
    }

    /// Scripted relay plus local client over in-memory pipes: CONNECT goes
    /// out, CONNECTED comes back, bytes flow both ways, CLOSE tears down.
    #[tokio::test]
    async fn test_tunnel_round_trip_over_in_memory_ws() {
        let (ws_client_io, ws_server_io) = tokio::io::duplex(64 * 1024);
        let (local_app, client_conn) = tokio::io::duplex(64 * 1024);

        let relay = tokio::spawn(async move {
            let mut ws =
                WebSocketStream::from_raw_socket(ws_server_io, Role::Server, None).await;

            let connect = ws.next().await.unwrap().unwrap();
            assert_eq!(
                connect,
                Message::Text("CONNECT:example.com:80|FIRST".into())
            );
            ws.send(Message::Text("CONNECTED".into())).await.unwrap();

            // Payload downstream, then wait for upstream payload and CLOSE
            ws.send(Message::Binary(b"RESPONSE".to_vec())).await.unwrap();
            loop {
                match ws.next().await.unwrap().unwrap() {
                    Message::Binary(data) => {
                        assert_eq!(data, b"UPSTREAM");
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => continue,
                    other => panic!("unexpected frame: {:?}", other),
                }
            }
            loop {
                match ws.next().await.unwrap() {
                    Ok(Message::Text(t)) if t == "CLOSE" => break,
                    Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                    Ok(Message::Close(_)) | Err(_) => break,
                    other => panic!("unexpected frame: {:?}", other),
                }
            }
        });

        let app = tokio::spawn(async move {
            let mut local_app = local_app;
            // HTTP-proxy mode: no success line; the tunnel response is the
            // first thing the app sees
            let mut buf = [0u8; 8];
            local_app.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"RESPONSE");

            local_app.write_all(b"UPSTREAM").await.unwrap();
            drop(local_app); // EOF drives the up-pump to send CLOSE
        });

        let ws =
            WebSocketStream::from_raw_socket(ws_client_io, Role::Client, None).await;
        let target = TargetAddr::domain("example.com", 80);
        let stats = test_stats();
        stats.record_connection("example.com");

        run_tunnel(
            stats.clone(),
            PrependStream::new(client_conn),
            ws,
            &target,
            ProxyMode::HttpProxy,
            b"FIRST".to_vec(),
        )
        .await
        .unwrap();

        relay.await.unwrap();
        app.await.unwrap();

        let site = stats.get_site_stats("example.com").unwrap();
        assert_eq!(site.upload, 5 + 8); // FIRST + UPSTREAM
        assert_eq!(site.download, 8); // RESPONSE
    }

    #[tokio::test]
    async fn test_relay_error_reply_fails_session() {
        let (ws_client_io, ws_server_io) = tokio::io::duplex(4096);
        let (_local_app, client_conn) = tokio::io::duplex(4096);

        let relay = tokio::spawn(async move {
            let mut ws =
                WebSocketStream::from_raw_socket(ws_server_io, Role::Server, None).await;
            let _connect = ws.next().await.unwrap().unwrap();
            ws.send(Message::Text("ERROR:connection refused".into()))
                .await
                .unwrap();
        });

        let ws =
            WebSocketStream::from_raw_socket(ws_client_io, Role::Client, None).await;
        let target = TargetAddr::domain("dead.example", 443);

        let result = run_tunnel(
            test_stats(),
            PrependStream::new(client_conn),
            ws,
            &target,
            ProxyMode::HttpConnect,
            Vec::new(),
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        relay.await.unwrap();
    }

    /// Cancelling twice and pinging a closed sink must be harmless.
    #[tokio::test(start_paused = true)]
    async fn test_idempotent_cancel_and_late_heartbeat() {
        let (ws_client_io, ws_server_io) = tokio::io::duplex(4096);

        let ws = WebSocketStream::from_raw_socket(ws_client_io, Role::Client, None).await;
        let (sink, _read) = ws.split();
        let sink: SharedSink<_> = Arc::new(Mutex::new(sink));

        let cancel = CancellationToken::new();
        cancel.cancel();
        cancel.cancel(); // second cancel is a no-op

        // Peer is gone and the sink is closed: a heartbeat must return,
        // not panic
        drop(ws_server_io);
        let _ = sink.lock().await.close().await;
        run_heartbeat(sink.clone(), CancellationToken::new()).await;
    }
}
