use anyhow::Result;
use clap::{Parser, Subcommand};
use engbot::Config;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "engbot",
    about = "Telegram update pipeline: webhook ingest, queue, admission-controlled worker",
    version
)]
struct Cli {
    /// Path to the config file (default: ./engbot.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook ingest HTTP server
    Ingest,
    /// Run the queue worker
    Worker,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Ingest => engbot::ingest::run(&config).await,
        Commands::Worker => engbot::worker::run(&config).await,
    }
}
