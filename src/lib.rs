//! Echtun - SOCKS5/HTTP proxy tunneling over TLS with Encrypted Client Hello
//!
//! # Architecture
//!
//! ```text
//! local app
//! → listener (one-byte demux)
//! → SOCKS5 | HTTP handler
//! → router (direct vs tunnel)
//! → tunnel session (WS over TLS-ECH) → relay server → target
//!   or direct session (plain TCP)   → target
//! ```
//!
//! ## Core principles
//!
//! - The outer TLS endpoint is decoupled from the logical SNI; ECH hides the
//!   inner name and is required, never downgraded
//! - Routing depends only on the target host and the CN-IP tables, no IO in
//!   the decision beyond name resolution
//! - Every data-plane byte is accounted per destination host
//!
//! ## Module structure
//!
//! ```text
//! src/
//! ├── common/          # Target addresses, replayable streams
//! ├── ech/             # DoH lookup + shared ECH config state
//! ├── transport/       # TLS-ECH dialer, WS dialer, in-tunnel DoH
//! ├── geoip/           # CN IP range database
//! ├── router/          # direct-vs-tunnel decision
//! ├── proxy/           # lifecycle, demux, SOCKS5/HTTP, tunnel/direct
//! ├── relay/           # the server side of the tunnel
//! └── stats/           # per-host traffic counters + persistence
//! ```

pub mod common;
pub mod config;
pub mod ech;
pub mod error;
pub mod geoip;
pub mod proxy;
pub mod relay;
pub mod router;
pub mod stats;
pub mod transport;

// Re-exports for convenience
pub use config::{ClientConfig, RoutingMode};
pub use error::{Error, Result};
pub use proxy::ProxyService;
pub use stats::TrafficStats;
