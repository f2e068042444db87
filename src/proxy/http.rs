//! HTTP proxy handler
//!
//! Two sub-modes on the same port: CONNECT tunneling, and absolute-form
//! proxying where the request is rewritten to origin form and rides into the
//! tunnel as the first frame. Header lines are kept verbatim (original case
//! and order) minus the proxy-hop headers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::info;

use crate::common::{PrependStream, TargetAddr};
use crate::error::{Error, Result};

use super::{tunnel, ProxyMode, SessionCtx, HANDSHAKE_DEADLINE};

/// Bodies above this size are not buffered into the first frame
const MAX_BODY_LENGTH: usize = 10 * 1024 * 1024;

const FORWARD_METHODS: [&str; 8] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE",
];

struct HttpRequest {
    method: String,
    uri: String,
    version: String,
    /// Raw header lines in arrival order
    header_lines: Vec<String>,
    /// Lowercased name -> value for lookups
    headers: HashMap<String, String>,
}

pub(crate) async fn handle(
    ctx: &Arc<SessionCtx>,
    stream: TcpStream,
    peer: &str,
    first_byte: u8,
) -> Result<()> {
    let mut stream = PrependStream::with_prefix(&[first_byte], stream);

    let request = tokio::time::timeout(HANDSHAKE_DEADLINE, read_request(&mut stream))
        .await
        .map_err(|_| Error::Timeout)??;

    if request.method == "CONNECT" {
        info!("[http-connect] {} -> {}", peer, request.uri);
        let target = match TargetAddr::parse_with_default(&request.uri, 443) {
            Ok(target) => target,
            Err(e) => {
                stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
                return Err(e);
            }
        };
        return tunnel::run_session(ctx, stream, target, ProxyMode::HttpConnect, Vec::new()).await;
    }

    if !FORWARD_METHODS.contains(&request.method.as_str()) {
        info!("[http] {} unsupported method: {}", peer, request.method);
        stream
            .write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
            .await?;
        return Err(Error::Protocol(format!(
            "unsupported HTTP method: {}",
            request.method
        )));
    }

    info!("[http-{}] {} -> {}", request.method, peer, request.uri);

    let Some((target_str, path)) = forward_target(&request) else {
        stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
        return Err(Error::Protocol("no target host in request".into()));
    };
    let target = match TargetAddr::parse_with_default(&target_str, 80) {
        Ok(target) => target,
        Err(e) => {
            stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
            return Err(e);
        }
    };

    let mut first_frame = rebuild_request(&request, &path);

    // Small bodies travel inside the first frame
    if let Some(length) = request
        .headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        if length > 0 && length < MAX_BODY_LENGTH {
            let mut body = vec![0u8; length];
            stream.read_exact(&mut body).await?;
            first_frame.extend_from_slice(&body);
        }
    }

    tunnel::run_session(ctx, stream, target, ProxyMode::HttpProxy, first_frame).await
}

/// Read the request line and headers, stopping at the blank line.
async fn read_request<S: AsyncRead + Unpin>(
    stream: &mut PrependStream<S>,
) -> Result<HttpRequest> {
    let request_line = stream.read_line().await?;
    let mut parts = request_line.split_whitespace();
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v)) => (m.to_string(), u.to_string(), v.to_string()),
        _ => {
            return Err(Error::Protocol(format!(
                "malformed request line: {:?}",
                request_line
            )))
        }
    };

    let mut header_lines = Vec::new();
    let mut headers = HashMap::new();
    loop {
        let line = stream.read_line().await?;
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
        header_lines.push(line);
    }

    Ok(HttpRequest {
        method,
        uri,
        version,
        header_lines,
        headers,
    })
}

/// Derive (host[:port], origin-form path) for an absolute-form request.
fn forward_target(request: &HttpRequest) -> Option<(String, String)> {
    if let Some(rest) = request.uri.strip_prefix("http://") {
        return match rest.find('/') {
            Some(idx) if idx > 0 => Some((rest[..idx].to_string(), rest[idx..].to_string())),
            None => Some((rest.to_string(), "/".to_string())),
            Some(_) => None,
        };
    }

    let host = request.headers.get("host")?;
    if host.is_empty() {
        return None;
    }
    Some((host.clone(), request.uri.clone()))
}

/// Origin-form request bytes: original header lines minus the proxy-hop
/// headers, terminated by the blank line. The body, if any, is appended by
/// the caller.
fn rebuild_request(request: &HttpRequest, path: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(request.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(path.as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.version.as_bytes());
    out.extend_from_slice(b"\r\n");

    for line in &request.header_lines {
        let key = line
            .split(':')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if key == "proxy-connection" || key == "proxy-authorization" {
            continue;
        }
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn parse(raw: &[u8]) -> HttpRequest {
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(raw).await.unwrap();
        let mut stream = PrependStream::new(client);
        read_request(&mut stream).await.unwrap()
    }

    #[tokio::test]
    async fn test_absolute_form_rewrite_drops_proxy_headers() {
        let request = parse(
            b"GET http://h/p HTTP/1.1\r\nHost: h\r\nProxy-Connection: keep-alive\r\n\r\n",
        )
        .await;

        let (target, path) = forward_target(&request).unwrap();
        assert_eq!(target, "h");
        assert_eq!(path, "/p");

        let frame = rebuild_request(&request, &path);
        assert_eq!(frame, b"GET /p HTTP/1.1\r\nHost: h\r\n\r\n");
    }

    #[tokio::test]
    async fn test_proxy_authorization_removed() {
        let request = parse(
            b"POST http://api.example/v1 HTTP/1.1\r\nHost: api.example\r\nProxy-Authorization: Basic Zm9v\r\nContent-Type: text/plain\r\n\r\n",
        )
        .await;

        let frame = rebuild_request(&request, "/v1");
        let text = String::from_utf8(frame).unwrap();
        assert!(!text.contains("Proxy-Authorization"));
        assert!(text.contains("Content-Type: text/plain"));
    }

    #[tokio::test]
    async fn test_relative_uri_uses_host_header() {
        let request = parse(b"GET /index.html HTTP/1.1\r\nHost: example.com:8080\r\n\r\n").await;

        let (target, path) = forward_target(&request).unwrap();
        assert_eq!(target, "example.com:8080");
        assert_eq!(path, "/index.html");

        let addr = TargetAddr::parse_with_default(&target, 80).unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[tokio::test]
    async fn test_absolute_uri_without_path() {
        let request = parse(b"GET http://bare.example HTTP/1.1\r\nHost: bare.example\r\n\r\n").await;
        let (target, path) = forward_target(&request).unwrap();
        assert_eq!(target, "bare.example");
        assert_eq!(path, "/");
    }

    #[tokio::test]
    async fn test_missing_host_yields_no_target() {
        let request = parse(b"GET /p HTTP/1.1\r\nAccept: */*\r\n\r\n").await;
        assert!(forward_target(&request).is_none());
    }

    #[tokio::test]
    async fn test_connect_request_parsing() {
        let request = parse(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n").await;
        assert_eq!(request.method, "CONNECT");
        let target = TargetAddr::parse_with_default(&request.uri, 443).unwrap();
        assert_eq!(target, TargetAddr::Domain("example.com".into(), 443));
    }
}
