//! CLI for cdxfed
//!
//! Runs capture-index queries against a source tree without starting the
//! server:
//! - query: look up captures of a URL
//! - sources: show the configured source tree

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "cdxfed")]
#[command(about = "cdxfed - federated web archive capture index", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look up captures of a URL across all configured sources
    Query(commands::query::QueryArgs),

    /// Show the configured source tree
    Sources(commands::sources::SourcesArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Query(args) => {
            init_tracing(args.verbose);
            commands::query::run(args).await
        }
        Commands::Sources(args) => commands::sources::run(args).await,
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
