//! TP/SL monitoring engine - main entry point
//!
//! Subcommands:
//! - run: start the monitoring engine against the configured accounts
//! - snapshot: print the persisted monitor state and exit

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "tpsl-engine")]
#[command(about = "Enhanced TP/SL monitoring and rebalancing engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the monitoring engine
    Run,

    /// Print the persisted monitor snapshot and exit
    Snapshot,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tpsl_engine::config::load_dotenv();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    // Keep the file-appender guard alive for the process lifetime.
    let _file_guard = match std::env::var("LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(&dir, "tpsl-engine.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    };

    match cli.command {
        Commands::Run => commands::run::run(),
        Commands::Snapshot => commands::snapshot::run(),
    }
}
