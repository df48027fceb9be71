use clap::Parser;
use floodledger::config::{Config, LoggingConfig};
use floodledger::input::run_input_loop;
use floodledger::Node;
use tokio::io::BufReader;

#[derive(Parser, Debug)]
#[command(name = "floodledger")]
#[command(about = "Flooding ledger node", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Address to listen on, overrides network.listen_address
    #[arg(long)]
    listen_addr: Option<String>,

    /// Peer to join through, overrides network.bootstrap
    #[arg(short, long)]
    bootstrap: Option<String>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.generate_config {
        let config = Config::default();
        match config.save_to_file(&args.config) {
            Ok(_) => {
                println!("Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_default(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config {}: {}", args.config, e);
            std::process::exit(1);
        }
    };
    if let Some(listen_addr) = args.listen_addr {
        config.network.listen_address = listen_addr;
    }
    if let Some(bootstrap) = args.bootstrap {
        config.network.bootstrap = Some(bootstrap);
    }

    setup_logging(&config.logging, args.verbose);

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    println!("\nfloodledger v{} ({})", version, git_hash);

    let node = match Node::start(config).await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("Failed to start node: {}", e);
            std::process::exit(1);
        }
    };
    println!("  Address: {}", node.address());
    println!("  Account: {}", node.public_key());
    println!("Enter transfers as `<amount> <from> <to>` (`me` is your account), `quit` to exit.\n");

    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        _ = run_input_loop(&node, stdin) => {}
        _ = node.shutdown_manager().wait_for_signal() => {}
    }

    node.shutdown().await;
    // A pending stdin read would otherwise keep the runtime alive.
    std::process::exit(0);
}

fn setup_logging(config: &LoggingConfig, verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "debug" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_thread_ids(false)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .with_timer(CustomTimer {
                    hostname: short_hostname,
                })
                .with_writer(std::io::stderr)
                .compact()
                .init();
        }
    }
}

// UTC time and hostname
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();

        // "2025-12-10 18:09:43.150 [server1]"
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
