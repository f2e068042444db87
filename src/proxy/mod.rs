//! Proxy service: lifecycle, accept loop and protocol demux
//!
//! One listener serves both SOCKS5 and HTTP. The accept loop reads exactly
//! one byte per connection and dispatches on it: `0x05` is SOCKS5, the first
//! letter of a supported HTTP method is HTTP, anything else is dropped. Each
//! connection runs in its own task; negotiation happens under a 30 s
//! deadline that streaming is not subject to.

pub mod direct;
pub mod http;
pub mod socks5;
pub mod tunnel;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, RoutingMode};
use crate::ech::EchState;
use crate::error::{Error, Result};
use crate::geoip::CnIpDb;
use crate::router::Decider;
use crate::stats::{format_bytes, TrafficStats, AUTOSAVE_INTERVAL};
use crate::transport::TunnelDohClient;

/// Deadline for protocol negotiation on a fresh connection
pub(crate) const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(30);

/// Client-side buffer size for relay loops
pub(crate) const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// How the client asked for the connection, which fixes the reply wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProxyMode {
    Socks5,
    HttpConnect,
    /// Absolute-form HTTP: the rebuilt request rides as the first frame and
    /// no explicit success line is sent
    HttpProxy,
}

/// Shared state for every session of one service run
pub(crate) struct SessionCtx {
    pub config: ClientConfig,
    pub ech: Arc<EchState>,
    pub decider: Decider,
    pub stats: Arc<TrafficStats>,
    doh: tokio::sync::RwLock<Option<Arc<TunnelDohClient>>>,
}

impl SessionCtx {
    /// In-tunnel DoH client, built lazily and cached per relay port.
    pub async fn tunnel_doh(&self) -> Result<Arc<TunnelDohClient>> {
        let port = self.config.server_endpoint()?.port;
        {
            let guard = self.doh.read().await;
            if let Some(client) = guard.as_ref() {
                if client.port() == port {
                    return Ok(client.clone());
                }
            }
        }

        let ech_list = self.ech.snapshot()?;
        let client = Arc::new(TunnelDohClient::build(&self.config, &ech_list).await?);
        *self.doh.write().await = Some(client.clone());
        Ok(client)
    }
}

struct ServiceState {
    running: bool,
    shutdown: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

/// The proxy client: local listener plus the supporting shared state.
///
/// States are `Stopped` and `Running`; `start`/`stop`/`restart` move between
/// them and `update_config` swaps the config, restarting if running.
pub struct ProxyService {
    config: RwLock<ClientConfig>,
    ech: Arc<EchState>,
    cnip: Arc<CnIpDb>,
    stats: Arc<TrafficStats>,
    state: Mutex<ServiceState>,
}

impl ProxyService {
    pub fn new(config: ClientConfig) -> Self {
        let stats = Arc::new(TrafficStats::new(&config.store_dir));
        let (upload, download) = stats.get_total_stats();
        if upload > 0 || download > 0 {
            info!(
                "[stats] restored traffic totals: up {}  down {}",
                format_bytes(upload),
                format_bytes(download)
            );
        }

        Self {
            config: RwLock::new(config),
            ech: Arc::new(EchState::new()),
            cnip: Arc::new(CnIpDb::new()),
            stats,
            state: Mutex::new(ServiceState {
                running: false,
                shutdown: None,
                tasks: Vec::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn get_config(&self) -> ClientConfig {
        self.config.read().clone()
    }

    pub fn stats(&self) -> Arc<TrafficStats> {
        self.stats.clone()
    }

    /// Acquire the ECH config, load routing data, bind the listener and
    /// spawn the accept and autosave tasks. ECH failure aborts the start;
    /// a routing-data failure is logged and tolerated.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.running {
                return Err(Error::Proxy("server already running".into()));
            }
            state.running = true;
        }

        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.lock().running = false;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        let config = self.config.read().clone();
        config.server_endpoint()?;

        info!("[start] acquiring ECH config...");
        self.ech
            .prepare(&config.ech_domain, &config.dns_server)
            .await
            .map_err(|e| Error::Ech(format!("failed to acquire ECH config: {}", e)))?;

        self.load_routing_data(&config).await;

        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|e| Error::Config(format!("failed to listen on {}: {}", config.listen_addr, e)))?;

        info!("[proxy] listening on {} (SOCKS5 + HTTP)", config.listen_addr);
        info!("[proxy] relay server: {}", config.server_addr);
        info!("[proxy] outer dial host: {}", config.outer_host());

        let (shutdown_tx, _) = broadcast::channel(1);

        let ctx = Arc::new(SessionCtx {
            decider: Decider::new(config.routing_mode, self.cnip.clone()),
            config,
            ech: self.ech.clone(),
            stats: self.stats.clone(),
            doh: tokio::sync::RwLock::new(None),
        });

        let accept = tokio::spawn(accept_loop(listener, ctx, shutdown_tx.subscribe()));
        let saver = tokio::spawn(autosave(self.stats.clone(), shutdown_tx.subscribe()));

        let mut state = self.state.lock();
        state.shutdown = Some(shutdown_tx);
        state.tasks = vec![accept, saver];
        Ok(())
    }

    async fn load_routing_data(&self, config: &ClientConfig) {
        match config.routing_mode {
            RoutingMode::BypassCn => {
                info!("[start] routing mode bypass_cn, loading CN IP lists...");
                match self.cnip.load(&config.store_dir).await {
                    Ok((v4, v6)) => info!("[start] loaded {} IPv4 ranges, {} IPv6 ranges", v4, v6),
                    Err(e) => warn!("[start] failed to load CN IP lists: {}", e),
                }
            }
            RoutingMode::Global => info!("[start] routing mode global"),
            RoutingMode::None => info!("[start] routing mode none (direct only)"),
        }
    }

    /// Stop accepting, drain background tasks and save stats. Sessions in
    /// flight keep their sockets until they finish on their own.
    pub async fn stop(&self) -> Result<()> {
        let (shutdown, tasks) = {
            let mut state = self.state.lock();
            if !state.running {
                return Err(Error::Proxy("server not running".into()));
            }
            state.running = false;
            (state.shutdown.take(), std::mem::take(&mut state.tasks))
        };

        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
        for task in tasks {
            let _ = task.await;
        }

        match self.stats.save() {
            Ok(()) => {
                let (up, down) = self.stats.get_total_stats();
                info!(
                    "[stats] saved traffic totals: up {}  down {}",
                    format_bytes(up),
                    format_bytes(down)
                );
            }
            Err(e) => error!("[stats] failed to save traffic stats: {}", e),
        }

        info!("[proxy] stopped");
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        info!("[proxy] restarting...");
        if let Err(e) = self.stop().await {
            if !e.to_string().contains("not running") {
                return Err(e);
            }
        }
        self.start().await
    }

    /// Replace the configuration; a running service restarts onto it.
    pub async fn update_config(&self, config: ClientConfig) -> Result<()> {
        *self.config.write() = config;
        if self.is_running() {
            return self.restart().await;
        }
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<SessionCtx>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("[proxy] accept loop shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("[proxy] accept failed: {}", e);
                        continue;
                    }
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    handle_connection(ctx, stream, peer.to_string()).await;
                });
            }
        }
    }
}

async fn autosave(stats: Arc<TrafficStats>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(AUTOSAVE_INTERVAL);
    ticker.tick().await; // the first tick fires immediately
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {
                if let Err(e) = stats.save() {
                    warn!("[stats] autosave failed: {}", e);
                }
            }
        }
    }
}

/// Peek one byte and dispatch. The byte is replayed to the chosen handler.
async fn handle_connection(ctx: Arc<SessionCtx>, mut stream: TcpStream, peer: String) {
    let mut first = [0u8; 1];
    match tokio::time::timeout(HANDSHAKE_DEADLINE, stream.read_exact(&mut first)).await {
        Ok(Ok(_)) => {}
        Ok(Err(_)) | Err(_) => return,
    }

    let result = match first[0] {
        0x05 => socks5::handle(&ctx, stream, &peer).await,
        b'C' | b'G' | b'P' | b'H' | b'D' | b'O' | b'T' => {
            http::handle(&ctx, stream, &peer, first[0]).await
        }
        other => {
            info!("[proxy] {} unknown protocol byte: 0x{:02x}", peer, other);
            return;
        }
    };

    if let Err(e) = result {
        if e.is_normal_close() {
            debug!("[proxy] {} closed: {}", peer, e);
        } else {
            error!("[proxy] {} session failed: {}", peer, e);
        }
    }
}

/// Mode-appropriate success reply, sent once the peer leg is up.
pub(crate) async fn send_success_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    mode: ProxyMode,
) -> std::io::Result<()> {
    match mode {
        ProxyMode::Socks5 => {
            w.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
        }
        ProxyMode::HttpConnect => {
            w.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
        }
        // The origin's response bytes are the client-visible reply
        ProxyMode::HttpProxy => {}
    }
    w.flush().await
}

/// Mode-appropriate failure reply; best-effort, the session is ending.
pub(crate) async fn send_error_reply<W: AsyncWrite + Unpin>(w: &mut W, mode: ProxyMode) {
    let _ = match mode {
        ProxyMode::Socks5 => {
            w.write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await
        }
        ProxyMode::HttpConnect | ProxyMode::HttpProxy => {
            w.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await
        }
    };
    let _ = w.flush().await;
}
