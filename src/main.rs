//! Echtun client - local SOCKS5/HTTP proxy over a TLS-ECH tunnel

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use echtun::config::{ClientConfig, RoutingMode};
use echtun::proxy::ProxyService;

fn main() {
    let args = Args::parse();

    if args.help {
        print_help();
        return;
    }

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let Some(server_addr) = args.server.filter(|s| !s.is_empty()) else {
        eprintln!("a relay server address is required (-f)");
        eprintln!();
        eprintln!("example:");
        eprintln!("  echtun -l 127.0.0.1:1080 -f your-worker.workers.dev:443 -token your-token");
        std::process::exit(1);
    };

    let routing_mode = match RoutingMode::parse(&args.routing) {
        Ok(mode) => mode,
        Err(other) => {
            warn!("unknown routing mode {:?}, falling back to global", other);
            RoutingMode::Global
        }
    };

    let store_dir = match store_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("failed to prepare store directory: {}", e);
            std::process::exit(1);
        }
    };

    let config = ClientConfig {
        listen_addr: args.listen,
        server_addr,
        server_ip: args.server_ip.filter(|s| !s.is_empty()),
        token: args.token,
        dns_server: args.dns,
        ech_domain: args.ech_domain,
        routing_mode,
        store_dir,
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    rt.block_on(async {
        let service = Arc::new(ProxyService::new(config));
        if let Err(e) = service.start().await {
            error!("[start] failed to start: {}", e);
            std::process::exit(1);
        }

        let (quit_tx, mut quit_rx) = tokio::sync::mpsc::channel::<()>(1);
        tokio::spawn(repl(service.clone(), quit_tx));

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("[exit] signal received, shutting down..."),
            _ = quit_rx.recv() => info!("[exit] quit requested, shutting down..."),
        }

        let _ = service.stop().await;
    });
}

/// Interactive command loop on stdin.
async fn repl(service: Arc<ProxyService>, quit: tokio::sync::mpsc::Sender<()>) {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    println!();
    println!("commands: restart, status, routing <mode>, quit (help for details)");

    loop {
        prompt();
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => return,
        };

        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = parts.first() else {
            continue;
        };

        match command.to_ascii_lowercase().as_str() {
            "restart" => {
                println!("restarting...");
                match service.restart().await {
                    Ok(()) => println!("restarted"),
                    Err(e) => println!("restart failed: {}", e),
                }
            }
            "status" => {
                let config = service.get_config();
                let state = if service.is_running() { "running" } else { "stopped" };
                println!("state:   {}", state);
                println!("listen:  {}", config.listen_addr);
                println!("server:  {}", config.server_addr);
                println!("routing: {}", config.routing_mode);
                println!("{}", service.stats().summary(10));
            }
            "routing" => {
                let Some(mode) = parts.get(1) else {
                    println!("usage: routing <global|bypass_cn|none>");
                    continue;
                };
                let mode = match RoutingMode::parse(mode) {
                    Ok(mode) => mode,
                    Err(_) => {
                        println!("invalid routing mode, expected global, bypass_cn or none");
                        continue;
                    }
                };
                let mut config = service.get_config();
                config.routing_mode = mode;
                println!("switching routing mode to {} and restarting...", mode);
                match service.update_config(config).await {
                    Ok(()) => println!("routing mode is now {}", mode),
                    Err(e) => println!("switch failed: {}", e),
                }
            }
            "quit" | "exit" | "q" => {
                println!("exiting...");
                let _ = quit.send(()).await;
                return;
            }
            "help" => print_repl_help(),
            other => println!("unknown command: {} (try help)", other),
        }
    }
}

fn prompt() {
    use std::io::Write;
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// Store directory next to the executable: `<exe dir>/.echtun`
fn store_dir() -> std::io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .map(|p| p.join(".echtun"))
        .unwrap_or_else(|| PathBuf::from(".echtun"));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Command line arguments, each flag shadowed by an ECHPLUS_* variable
struct Args {
    listen: String,
    server: Option<String>,
    server_ip: Option<String>,
    token: String,
    dns: String,
    ech_domain: String,
    routing: String,
    help: bool,
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

impl Args {
    fn parse() -> Self {
        let mut parsed = Self {
            listen: env_or("ECHPLUS_LISTEN", "127.0.0.1:30000"),
            server: std::env::var("ECHPLUS_SERVER").ok().filter(|s| !s.is_empty()),
            server_ip: std::env::var("ECHPLUS_SERVER_IP").ok().filter(|s| !s.is_empty()),
            token: env_or("ECHPLUS_TOKEN", "147258369"),
            dns: env_or("ECHPLUS_DNS", "dns.alidns.com/dns-query"),
            ech_domain: env_or("ECHPLUS_ECH_DOMAIN", "cloudflare-ech.com"),
            routing: env_or("ECHPLUS_ROUTING", "global"),
            help: false,
        };

        let args: Vec<String> = std::env::args().collect();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-l" if i + 1 < args.len() => {
                    parsed.listen = args[i + 1].clone();
                    i += 1;
                }
                "-f" if i + 1 < args.len() => {
                    parsed.server = Some(args[i + 1].clone());
                    i += 1;
                }
                "-ip" if i + 1 < args.len() => {
                    parsed.server_ip = Some(args[i + 1].clone());
                    i += 1;
                }
                "-token" if i + 1 < args.len() => {
                    parsed.token = args[i + 1].clone();
                    i += 1;
                }
                "-dns" if i + 1 < args.len() => {
                    parsed.dns = args[i + 1].clone();
                    i += 1;
                }
                "-ech" if i + 1 < args.len() => {
                    parsed.ech_domain = args[i + 1].clone();
                    i += 1;
                }
                "-routing" if i + 1 < args.len() => {
                    parsed.routing = args[i + 1].clone();
                    i += 1;
                }
                "-h" | "--help" => parsed.help = true,
                _ => {}
            }
            i += 1;
        }

        parsed
    }
}

fn print_help() {
    println!(
        r#"Echtun - SOCKS5/HTTP proxy over a TLS-ECH tunnel

USAGE:
    echtun -f <host:port[/path]> [OPTIONS]

OPTIONS:
    -l <addr>        Local listen address, SOCKS5 + HTTP on one port
                     (default 127.0.0.1:30000) [env: ECHPLUS_LISTEN]
    -f <addr>        Relay server, e.g. x.x.workers.dev:443 [env: ECHPLUS_SERVER]
    -ip <host>       Pin the outer TCP dial to this IP or host; the TLS SNI
                     still uses the host from -f [env: ECHPLUS_SERVER_IP]
    -token <token>   Auth token sent as the WebSocket subprotocol
                     [env: ECHPLUS_TOKEN]
    -dns <server>    Bootstrap DoH server for the ECH lookup
                     (default dns.alidns.com/dns-query) [env: ECHPLUS_DNS]
    -ech <domain>    Name whose HTTPS record carries the ECH config
                     (default cloudflare-ech.com) [env: ECHPLUS_ECH_DOMAIN]
    -routing <mode>  global, bypass_cn or none (default global)
                     [env: ECHPLUS_ROUTING]
    -h, --help       Print help

EXAMPLES:
    echtun -f your-worker.workers.dev:443 -token secret
    echtun -f 127.0.0.1:3325 -token t -routing bypass_cn
"#
    );
}

fn print_repl_help() {
    println!(
        r#"commands:
  restart        - restart the proxy
  status         - show state, config and traffic totals
  routing <mode> - switch routing mode (global/bypass_cn/none) and restart
  quit/exit/q    - exit"#
    );
}
