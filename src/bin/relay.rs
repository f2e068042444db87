//! Echtun relay - WebSocket tunnel endpoint

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn main() {
    let args = Args::parse();

    if args.help {
        print_help();
        return;
    }

    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(echtun::relay::serve(args.port, args.token)) {
        eprintln!("relay error: {}", e);
        std::process::exit(1);
    }
}

/// Command line arguments: `-t` shadowed by TOKEN, `-p` by PORT
struct Args {
    token: String,
    port: u16,
    help: bool,
}

impl Args {
    fn parse() -> Self {
        let mut parsed = Self {
            token: std::env::var("TOKEN").unwrap_or_else(|_| "147258369".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3325),
            help: false,
        };

        let args: Vec<String> = std::env::args().collect();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-t" if i + 1 < args.len() => {
                    parsed.token = args[i + 1].clone();
                    i += 1;
                }
                "-p" if i + 1 < args.len() => {
                    if let Ok(port) = args[i + 1].parse() {
                        parsed.port = port;
                    }
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
        r#"Echtun relay - WebSocket tunnel endpoint

USAGE:
    echtun-relay [OPTIONS]

OPTIONS:
    -t <token>   Authentication token clients must present as their
                 WebSocket subprotocol (default 147258369) [env: TOKEN]
    -p <port>    Listen port (default 3325) [env: PORT]
    -h, --help   Print help

ENDPOINTS:
    GET /health  liveness probe, answers 200 OK
    any other    WebSocket upgrade carrying the tunnel protocol
"#
    );
}
