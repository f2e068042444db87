//! SOCKS5 handler
//!
//! RFC 1928 subset: no-auth negotiation, CONNECT, and UDP ASSOCIATE limited
//! to DNS. UDP datagrams for port 53 are answered through the in-tunnel DoH
//! client; everything else is dropped. The dispatcher has already consumed
//! the version byte before this handler runs.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::{PrependStream, TargetAddr};
use crate::error::{Error, Result};

use super::{tunnel, ProxyMode, SessionCtx, HANDSHAKE_DEADLINE};

const SOCKS5_VERSION: u8 = 0x05;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

const UDP_READ_TICK: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 65535;

enum Command {
    Connect(TargetAddr),
    UdpAssociate,
}

pub(crate) async fn handle(ctx: &Arc<SessionCtx>, mut stream: TcpStream, peer: &str) -> Result<()> {
    let command = tokio::time::timeout(HANDSHAKE_DEADLINE, negotiate(&mut stream))
        .await
        .map_err(|_| Error::Timeout)??;

    match command {
        Command::Connect(target) => {
            info!("[socks5] {} -> {}", peer, target);
            tunnel::run_session(
                ctx,
                PrependStream::new(stream),
                target,
                ProxyMode::Socks5,
                Vec::new(),
            )
            .await
        }
        Command::UdpAssociate => udp_associate(ctx, stream, peer).await,
    }
}

/// Method negotiation and request parsing, up to the point where a reply
/// can be sent. Unsupported requests are answered here and returned as
/// protocol errors.
async fn negotiate<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<Command> {
    // Version byte was consumed by the demux; next is NMETHODS
    let mut nmethods = [0u8; 1];
    stream.read_exact(&mut nmethods).await?;
    let mut methods = vec![0u8; nmethods[0] as usize];
    stream.read_exact(&mut methods).await?;

    // Always pick no-auth, whatever was offered
    stream.write_all(&[SOCKS5_VERSION, 0x00]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(Error::Protocol(format!(
            "bad SOCKS version in request: 0x{:02x}",
            header[0]
        )));
    }

    let command = header[1];
    let atyp = header[3];

    let target = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            Some(TargetAddr::Socket(SocketAddr::new(
                Ipv4Addr::from(addr).into(),
                port,
            )))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            let port = read_port(stream).await?;
            let domain = String::from_utf8_lossy(&domain).to_string();
            Some(TargetAddr::Domain(domain, port))
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            Some(TargetAddr::Socket(SocketAddr::new(
                Ipv6Addr::from(addr).into(),
                port,
            )))
        }
        _ => None,
    };

    let Some(target) = target else {
        reply(stream, REP_ATYP_NOT_SUPPORTED).await?;
        return Err(Error::Protocol(format!("unsupported ATYP: 0x{:02x}", atyp)));
    };

    match command {
        CMD_CONNECT => Ok(Command::Connect(target)),
        CMD_UDP_ASSOCIATE => Ok(Command::UdpAssociate),
        other => {
            reply(stream, REP_CMD_NOT_SUPPORTED).await?;
            Err(Error::Protocol(format!("unsupported command: 0x{:02x}", other)))
        }
    }
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u16> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

async fn reply<S: AsyncWrite + Unpin>(stream: &mut S, code: u8) -> Result<()> {
    stream
        .write_all(&[SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

/// Bind a loopback UDP socket, hand its port to the client, and relay DNS
/// datagrams until the control connection goes away. A single read on the
/// control connection is the keep-alive indicator.
async fn udp_associate(ctx: &Arc<SessionCtx>, mut control: TcpStream, peer: &str) -> Result<()> {
    let udp = match UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            reply(&mut control, REP_GENERAL_FAILURE).await?;
            return Err(e.into());
        }
    };
    let port = udp.local_addr()?.port();
    info!("[udp] {} UDP ASSOCIATE on port {}", peer, port);

    let mut response = vec![SOCKS5_VERSION, 0x00, 0x00, ATYP_IPV4, 127, 0, 0, 1];
    response.extend_from_slice(&port.to_be_bytes());
    control.write_all(&response).await?;

    let cancel = CancellationToken::new();
    let relay = tokio::spawn(udp_relay(ctx.clone(), udp, cancel.clone(), peer.to_string()));

    // Block until the client drops the TCP leg (EOF, reset, or stray byte)
    let mut keepalive = [0u8; 1];
    let _ = control.read(&mut keepalive).await;

    cancel.cancel();
    let _ = relay.await;
    info!("[udp] {} UDP ASSOCIATE closed", peer);
    Ok(())
}

async fn udp_relay(ctx: Arc<SessionCtx>, udp: UdpSocket, cancel: CancellationToken, peer: String) {
    let udp = Arc::new(udp);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (n, from) = tokio::select! {
            _ = cancel.cancelled() => return,
            received = tokio::time::timeout(UDP_READ_TICK, udp.recv_from(&mut buf)) => {
                match received {
                    Err(_) => continue, // tick: re-check cancellation
                    Ok(Err(_)) => return,
                    Ok(Ok(pair)) => pair,
                }
            }
        };

        let Some((header_len, target)) = parse_udp_header(&buf[..n]) else {
            continue;
        };

        if target.port() == 53 {
            debug!("[udp-dns] {} -> {} (DoH)", peer, target);
            let ctx = ctx.clone();
            let udp = udp.clone();
            let header = buf[..header_len].to_vec();
            let query = buf[header_len..n].to_vec();
            tokio::spawn(async move {
                if let Err(e) = answer_dns(&ctx, &udp, from, header, query).await {
                    warn!("[udp-dns] DoH query failed: {}", e);
                }
            });
        } else {
            info!("[udp] {} -> {} dropped (only DNS is relayed)", peer, target);
        }
    }
}

/// Parse the SOCKS5 UDP request header, returning its length and the
/// destination. Fragmented datagrams (FRAG != 0) are rejected.
fn parse_udp_header(data: &[u8]) -> Option<(usize, TargetAddr)> {
    if data.len() < 10 || data[2] != 0x00 {
        return None;
    }

    match data[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            ip.copy_from_slice(&data[4..8]);
            let port = u16::from_be_bytes([data[8], data[9]]);
            Some((
                10,
                TargetAddr::Socket(SocketAddr::new(Ipv4Addr::from(ip).into(), port)),
            ))
        }
        ATYP_DOMAIN => {
            let len = data[4] as usize;
            if data.len() < 7 + len {
                return None;
            }
            let host = String::from_utf8_lossy(&data[5..5 + len]).to_string();
            let port = u16::from_be_bytes([data[5 + len], data[6 + len]]);
            Some((7 + len, TargetAddr::Domain(host, port)))
        }
        ATYP_IPV6 => {
            if data.len() < 22 {
                return None;
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&data[4..20]);
            let port = u16::from_be_bytes([data[20], data[21]]);
            Some((
                22,
                TargetAddr::Socket(SocketAddr::new(Ipv6Addr::from(ip).into(), port)),
            ))
        }
        _ => None,
    }
}

/// Resolve one DNS query over the tunnel and echo it back under the same
/// SOCKS5 UDP header.
async fn answer_dns(
    ctx: &SessionCtx,
    udp: &UdpSocket,
    client: SocketAddr,
    header: Vec<u8>,
    query: Vec<u8>,
) -> Result<()> {
    let doh = ctx.tunnel_doh().await?;
    let answer = doh.query(&query).await?;

    let mut response = header;
    response.extend_from_slice(&answer);
    udp.send_to(&response, client).await?;
    debug!("[udp-dns] answered {} bytes", answer.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive `negotiate` from the client side of an in-memory pair.
    async fn run_negotiation(client_bytes: &[u8]) -> (Result<Command>, Vec<u8>) {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(client_bytes).await.unwrap();

        let outcome = negotiate(&mut server).await;

        let mut replies = vec![0u8; 64];
        let n = match tokio::time::timeout(
            std::time::Duration::from_millis(50),
            client.read(&mut replies),
        )
        .await
        {
            Ok(Ok(n)) => n,
            _ => 0,
        };
        replies.truncate(n);
        (outcome, replies)
    }

    #[tokio::test]
    async fn test_connect_handshake_round_trip() {
        // Demux already consumed 0x05; the stream starts at NMETHODS.
        // Method selection 05 01 00, then CONNECT to example.com:443.
        let mut bytes = vec![0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 11]);
        bytes.extend_from_slice(b"example.com");
        bytes.extend_from_slice(&443u16.to_be_bytes());

        let (outcome, replies) = run_negotiation(&bytes).await;
        assert_eq!(&replies, &[0x05, 0x00]);

        match outcome.unwrap() {
            Command::Connect(target) => {
                assert_eq!(target, TargetAddr::Domain("example.com".into(), 443))
            }
            Command::UdpAssociate => panic!("expected CONNECT"),
        }

        // The success reply completes the exchange once the peer leg is up
        let mut out = Vec::new();
        super::super::send_success_reply(&mut out, ProxyMode::Socks5)
            .await
            .unwrap();
        assert_eq!(&out, &[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_bind_command_rejected() {
        let mut bytes = vec![0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4]);
        bytes.extend_from_slice(&80u16.to_be_bytes());

        let (outcome, replies) = run_negotiation(&bytes).await;
        assert!(outcome.is_err());
        // 05 00 method selection, then command-not-supported reply
        assert_eq!(replies[..2], [0x05, 0x00]);
        assert_eq!(replies[2..4], [0x05, REP_CMD_NOT_SUPPORTED]);
    }

    #[tokio::test]
    async fn test_unknown_atyp_rejected() {
        let mut bytes = vec![0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x05]);

        let (outcome, replies) = run_negotiation(&bytes).await;
        assert!(outcome.is_err());
        assert_eq!(replies[2..4], [0x05, REP_ATYP_NOT_SUPPORTED]);
    }

    #[test]
    fn test_parse_udp_header_ipv4() {
        let mut datagram = vec![0, 0, 0, ATYP_IPV4, 8, 8, 8, 8, 0, 53];
        datagram.extend_from_slice(b"dns-query");

        let (len, target) = parse_udp_header(&datagram).unwrap();
        assert_eq!(len, 10);
        assert_eq!(target.to_string(), "8.8.8.8:53");
        assert_eq!(&datagram[len..], b"dns-query");
    }

    #[test]
    fn test_parse_udp_header_domain() {
        let mut datagram = vec![0, 0, 0, ATYP_DOMAIN, 7];
        datagram.extend_from_slice(b"example");
        datagram.extend_from_slice(&53u16.to_be_bytes());
        datagram.extend_from_slice(b"payload");

        let (len, target) = parse_udp_header(&datagram).unwrap();
        assert_eq!(len, 7 + 7);
        assert_eq!(target, TargetAddr::Domain("example".into(), 53));
    }

    #[test]
    fn test_parse_udp_header_rejects_fragments() {
        let datagram = vec![0, 0, 1, ATYP_IPV4, 8, 8, 8, 8, 0, 53, 0xAA];
        assert!(parse_udp_header(&datagram).is_none());
    }

    #[test]
    fn test_parse_udp_header_rejects_truncated() {
        assert!(parse_udp_header(&[0, 0, 0, ATYP_IPV4, 8, 8]).is_none());
        let short_domain = vec![0, 0, 0, ATYP_DOMAIN, 50, b'x'];
        assert!(parse_udp_header(&short_domain).is_none());
    }
}
