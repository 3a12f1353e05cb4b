//! Sources command implementation

use crate::output;
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct SourcesArgs {
    /// Source tree definition (TOML)
    #[arg(short, long, env = "CDXFED_CONFIG")]
    pub config: PathBuf,

    /// Print JSON instead of a tree
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: SourcesArgs) -> Result<()> {
    let aggregator = super::load_aggregator(&args.config)?;
    let sources = aggregator.sources();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&sources)?);
    } else if sources.is_empty() {
        output::warning("No sources configured");
    } else {
        print!("{}", output::source_tree(&sources));
    }
    Ok(())
}
