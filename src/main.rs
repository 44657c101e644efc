//! twinproxy - dual-protocol forward proxy with policy routing

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use twinproxy::app::{self, metrics::init_metrics, Proxy};
use twinproxy::config::Config;
use twinproxy::error::Result;
use twinproxy::protocol::create_protocol;
use twinproxy::router::Dialer;
use twinproxy::shutdown::{listen_signals, Coordinator, DrainOutcome, Termination};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        let json = serde_json::to_string_pretty(&Config::sample())
            .map_err(|e| twinproxy::Error::Config(e.to_string()))?;
        println!("{}", json);
        return Ok(());
    }

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    if args.config.is_none() {
        info!("No config file specified, using defaults");
    }
    info!("twinproxy v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    let termination = rt.block_on(run(config))?;

    info!("Goodbye ({:?})", termination);
    Ok(())
}

async fn run(config: Config) -> Result<Termination> {
    let coordinator = Coordinator::new(config.shutdown.timeout());
    init_metrics();

    let policy = config.load_policy()?;
    let tunnel = config.build_tunnel()?;
    let dialer = Arc::new(Dialer::new(config.proxy.routing(), policy, tunnel));

    let proxy = Proxy::start(
        &config.proxy.bind_addr()?,
        create_protocol(config.proxy.http),
        dialer,
        &coordinator,
    )
    .await?;

    if let Some(api) = &config.api {
        app::start_api_server(&api.listen, &coordinator).await?;
    }

    let termination = listen_signals(&coordinator, config.shutdown.host_managed).await?;

    // Free the listening port before a new instance binds it
    proxy.close().await;

    match coordinator.await_shutdown_complete().await {
        DrainOutcome::Clean => info!("Shutdown complete"),
        DrainOutcome::TimedOut { outstanding } => {
            warn!("Shutdown forced with {} units of work outstanding", outstanding)
        }
    }

    if termination == Termination::Restart {
        if let Err(e) = app::relaunch() {
            error!("Failed to relaunch: {}", e);
        }
    }

    Ok(termination)
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    gen_config: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut gen_config = false;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
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
            gen_config,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"twinproxy - HTTP/SOCKS5 forward proxy with policy routing

USAGE:
    twinproxy [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config            Print an example config
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    twinproxy -c config.json
    twinproxy --gen-config > config.json

SIGNALS:
    SIGINT, SIGQUIT, SIGHUP  Graceful stop
    SIGTERM                  Graceful restart (stop when shutdown.host_managed)

API ENDPOINTS:
    GET /metrics             Prometheus metrics
"#
    );
}

fn print_version() {
    println!("twinproxy v{}", env!("CARGO_PKG_VERSION"));
    println!("HTTP/SOCKS5 forward proxy with policy routing");
}
