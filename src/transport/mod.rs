//! Outbound transports: the ECH TLS dialer, the WebSocket tunnel dialer and
//! the in-tunnel DoH client.

pub mod doh_client;
pub mod tls;
pub mod ws;

pub use doh_client::TunnelDohClient;
pub use tls::{build_tls_config, dial_tls, is_ech_error};
pub use ws::{dial_ws, WsStream};
