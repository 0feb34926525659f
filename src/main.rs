//! Strait - ingress core for a multi-protocol forward proxy

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use strait::app::{self, Dispatcher};
use strait::auth::Authenticator;
use strait::config::Config;
use strait::error::Result;
use strait::inbound::ingress_channels;
use strait::stats::Manager;
use strait::supervisor::Supervisor;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
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

    // Load configuration
    let config = if let Some(path) = args.config {
        Config::load(&path)?
    } else {
        info!("No config file specified, using defaults");
        Config::default()
    };

    info!("Strait v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config, args.api_listen))
}

async fn run(config: Config, api_override: Option<String>) -> Result<()> {
    let auth = Arc::new(Authenticator::new(&config.authentication));
    let supervisor = Supervisor::new(auth);
    supervisor.set_allow_lan(config.allow_lan);
    supervisor.set_bind_address(&config.bind_address);

    let ((tcp_tx, tcp_rx), (udp_tx, udp_rx)) = ingress_channels();

    supervisor
        .recreate_ports(config.ports(), tcp_tx.clone(), udp_tx.clone())
        .await;
    supervisor
        .recreate_inbounds(config.inbounds.clone(), tcp_tx.clone(), udp_tx.clone())
        .await;
    supervisor
        .recreate_tunnels(config.tunnels.clone(), tcp_tx.clone(), udp_tx.clone())
        .await;

    let manager = Manager::new();
    let dispatcher = Dispatcher::new(manager.clone());
    app::start(dispatcher, manager.clone(), tcp_rx, udp_rx);

    let api_listen = api_override.or_else(|| config.api.as_ref().map(|api| api.listen.clone()));
    if let Some(listen) = api_listen {
        match listen.parse() {
            Ok(addr) => {
                tokio::spawn(app::start_api_server(addr, manager));
            }
            Err(_) => tracing::warn!("Invalid API listen address: {}", listen),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    version: bool,
    api_listen: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut version = false;
        let mut api_listen = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--api" => {
                    if i + 1 < args.len() {
                        api_listen = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            version,
            api_listen,
        }
    }
}

fn print_help() {
    println!(
        r#"Strait - ingress core for a multi-protocol forward proxy

USAGE:
    strait [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --api <ADDR>            Stats API listen address (e.g., 127.0.0.1:9090)
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    strait -c config.json
    strait -c config.json --api 127.0.0.1:9090

STATS API ENDPOINTS:
    GET /connections        Live flows with byte counters
    GET /traffic            Instantaneous up/down rates
    GET /metrics            Prometheus metrics
"#
    );
}

fn print_version() {
    println!("Strait v{}", env!("CARGO_PKG_VERSION"));
}
