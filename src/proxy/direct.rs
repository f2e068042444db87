//! Direct session
//!
//! Runs a connection the router decided to bypass: plain TCP to the target,
//! first frame written ahead, then two memory-only relay loops accounting
//! bytes per direction.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::common::{PrependStream, TargetAddr};
use crate::error::{Error, Result};
use crate::stats::TrafficStats;

use super::{send_error_reply, send_success_reply, ProxyMode, SessionCtx, RELAY_BUFFER_SIZE};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) async fn run_session(
    ctx: &Arc<SessionCtx>,
    mut client: PrependStream<TcpStream>,
    target: TargetAddr,
    mode: ProxyMode,
    first_frame: Vec<u8>,
) -> Result<()> {
    let conn = match dial(&target).await {
        Ok(conn) => conn,
        Err(e) => {
            send_error_reply(&mut client, mode).await;
            return Err(Error::Proxy(format!("direct dial to {} failed: {}", target, e)));
        }
    };

    send_success_reply(&mut client, mode).await?;
    relay(ctx.stats.clone(), client, conn, &target, first_frame).await
}

async fn dial(target: &TargetAddr) -> Result<TcpStream> {
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

async fn relay<C, T>(
    stats: Arc<TrafficStats>,
    client: C,
    mut conn: T,
    target: &TargetAddr,
    first_frame: Vec<u8>,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let host = target.host();

    if !first_frame.is_empty() {
        conn.write_all(&first_frame).await?;
        stats.record_upload(&host, first_frame.len() as u64);
    }
    info!("[direct] {} connected", target);

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut conn_read, mut conn_write) = tokio::io::split(conn);

    let upload = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = match client_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if conn_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
            stats.record_upload(&host, n as u64);
            total += n as u64;
        }
        let _ = conn_write.shutdown().await;
        total
    };

    let download = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = match conn_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if client_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
            stats.record_download(&host, n as u64);
            total += n as u64;
        }
        let _ = client_write.shutdown().await;
        total
    };

    let (up, down) = tokio::join!(upload, download);
    debug!("[direct] {} closed (up {} down {})", target, up, down);
    Ok(())
}
