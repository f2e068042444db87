//! Error types for echtun

use thiserror::Error;

/// Main error type for echtun
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("ECH unavailable: {0}")]
    Ech(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,
}

/// Result type alias for echtun
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Normal connection teardown: EOF, reset, half-closed writes and the
    /// WebSocket close handshake. These end a session without being failures.
    pub fn is_normal_close(&self) -> bool {
        match self {
            Error::Io(e) => is_normal_close_io(e),
            Error::Proxy(msg) | Error::Protocol(msg) => {
                msg.contains("normal closure") || msg.contains("Connection reset")
            }
            _ => false,
        }
    }
}

/// Classify an IO error as routine peer disconnect rather than a fault.
pub fn is_normal_close_io(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_normal_close_classification() {
        let reset = Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(reset.is_normal_close());

        let refused = Error::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(!refused.is_normal_close());

        assert!(!Error::Timeout.is_normal_close());
        assert!(Error::Proxy("WebSocket protocol error: normal closure".into()).is_normal_close());
    }
}
