mod auth;
mod command;
mod config;
mod connection;
mod crypto;
mod secret;
mod server;

use clap::Parser;
use tracing_subscriber::EnvFilter;

const BANNER: &str = r#"
  ╔══════════════════════════════════════════════════╗
  ║                S S H - D R O P  v0.4             ║
  ║        one secret, one client, one channel       ║
  ╚══════════════════════════════════════════════════╝
"#;

#[tokio::main]
async fn main() {
    let cli = config::Cli::parse();

    // Envelope tooling runs standalone — no config file, no listener.
    if let Some(path) = &cli.encrypt {
        std::process::exit(command::run_encrypt(path));
    }
    if let Some(path) = &cli.decrypt {
        std::process::exit(command::run_decrypt(path));
    }

    let config = match config::Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config);
    eprintln!("{BANNER}");

    if let Err(e) = server::run(config).await {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}

/// Set up tracing with the configured log level, to stderr or to log_file.
fn init_tracing(config: &config::Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let log_file = config.log_file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("could not open log file {path}: {e}; logging to stderr"))
            .ok()
    });

    match log_file {
        Some(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::uptime())
                .init();
        }
    }
}
