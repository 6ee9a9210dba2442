use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::{open_store, RateLimiter};

/// Token bucket rate limiting against shared storage.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the bucket table if it does not exist
    Prepare,
    /// Take tokens from a bucket; exits 1 when denied
    Consume {
        identifier: String,
        #[arg(short, long, default_value_t = 1)]
        tokens: u64,
    },
    /// Show how many tokens a bucket holds
    Remaining { identifier: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TollgateConfig::load(cli.config.as_deref())?;
    info!(
        backend = ?config.storage.backend,
        capacity = config.bucket.capacity,
        tokens_per_unit = config.bucket.tokens_per_unit,
        unit = ?config.bucket.unit,
        "Configuration loaded"
    );

    let store = open_store(&config.storage).await?;

    match cli.command {
        Command::Prepare => {
            store.prepare().await?;
            info!("Bucket storage prepared");
            Ok(ExitCode::SUCCESS)
        }
        Command::Consume { identifier, tokens } => {
            let limiter = RateLimiter::from_config(store, &config.bucket)?;
            if limiter.consume(&identifier, tokens).await? {
                println!("granted");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("denied");
                Ok(ExitCode::from(1))
            }
        }
        Command::Remaining { identifier } => {
            let limiter = RateLimiter::from_config(store, &config.bucket)?;
            let tokens = limiter.remaining(&identifier).await?;
            println!("{:.3}", tokens);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Install the global subscriber, filtered by RUST_LOG (default `info`).
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
