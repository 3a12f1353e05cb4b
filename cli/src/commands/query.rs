//! Query command implementation

use crate::output;
use anyhow::{Context, Result};
use cdxfed_aggregator::source::SourceResult;
use cdxfed_shared::{IndexQuery, OutputFormat};
use clap::Args;
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// URL to look up; a trailing `*` means prefix, a leading `*.` domain
    pub url: String,

    /// Source tree definition (TOML)
    #[arg(short, long, env = "CDXFED_CONFIG")]
    pub config: PathBuf,

    /// exact, prefix, host or domain
    #[arg(short, long)]
    pub match_type: Option<String>,

    /// Sort by distance to this timestamp
    #[arg(long)]
    pub closest: Option<String>,

    /// On equal distance prefer `earlier` or `later` captures
    #[arg(long)]
    pub closest_tie: Option<String>,

    /// Only captures whose timestamp starts with these digits
    #[arg(long)]
    pub timestamp: Option<String>,

    #[arg(long)]
    pub from: Option<String>,

    #[arg(long)]
    pub to: Option<String>,

    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Newest first
    #[arg(short, long)]
    pub reverse: bool,

    /// Field filter, e.g. `status:200` or `!~mime:image/` (repeatable)
    #[arg(short, long)]
    pub filter: Vec<String>,

    /// Comma-separated source names; `outer:inner` selects nested sources
    #[arg(short, long)]
    pub sources: Option<String>,

    #[arg(long)]
    pub resolve_revisits: bool,

    /// Keep one capture per timestamp prefix of this many digits
    #[arg(long)]
    pub collapse_time: Option<usize>,

    #[arg(long)]
    pub page: Option<usize>,

    #[arg(long)]
    pub page_size: Option<usize>,

    /// Print the page count of paged sources instead of captures
    #[arg(long)]
    pub show_num_pages: bool,

    /// Extra `key=value` parameters for key templates (repeatable)
    #[arg(short = 'p', long = "param")]
    pub params: Vec<String>,

    /// cdxj, json or link
    #[arg(short, long, default_value = "cdxj")]
    pub output: String,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl QueryArgs {
    /// The same parameter pairs the HTTP endpoint would receive.
    pub fn to_params(&self) -> Result<Vec<(String, String)>> {
        let mut pairs = vec![("url".to_string(), self.url.clone())];
        let mut push = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                pairs.push((key.to_string(), value));
            }
        };
        push("matchType", self.match_type.clone());
        push("closest", self.closest.clone());
        push("closestTie", self.closest_tie.clone());
        push("timestamp", self.timestamp.clone());
        push("from", self.from.clone());
        push("to", self.to.clone());
        push("limit", self.limit.map(|n| n.to_string()));
        push("sources", self.sources.clone());
        push("collapseTime", self.collapse_time.map(|n| n.to_string()));
        push("page", self.page.map(|n| n.to_string()));
        push("pageSize", self.page_size.map(|n| n.to_string()));
        if self.reverse {
            push("reverse", Some("true".into()));
        }
        if self.resolve_revisits {
            push("resolveRevisits", Some("true".into()));
        }
        if self.show_num_pages {
            push("showNumPages", Some("true".into()));
        }
        for filter in &self.filter {
            push("filter", Some(filter.clone()));
        }
        for param in &self.params {
            let (key, value) = param
                .split_once('=')
                .with_context(|| format!("Invalid parameter {:?}, expected key=value", param))?;
            push(key, Some(value.to_string()));
        }
        Ok(pairs)
    }
}

pub async fn run(args: QueryArgs) -> Result<()> {
    let format: OutputFormat = args.output.parse()?;
    let query = IndexQuery::from_params(&args.to_params()?)?;
    let aggregator = super::load_aggregator(&args.config)?;
    debug!(urlkey = %query.urlkey, match_type = ?query.match_type, "running query");

    if query.show_num_pages {
        match aggregator.num_pages(&query).await? {
            Some(count) => println!("{}", serde_json::to_string_pretty(&count)?),
            None => output::info("No paged sources answered this query"),
        }
        return Ok(());
    }

    let SourceResult { records, errors } = match aggregator.search(&query).await {
        Ok(result) => result,
        Err(cdxfed_shared::IndexError::AllSourcesFailed(errors)) => {
            output::source_errors(&errors);
            anyhow::bail!("All sources failed");
        }
        Err(e) => return Err(e.into()),
    };

    let body = tokio::task::spawn_blocking(move || format.render_all(records))
        .await
        .context("Rendering failed")?;
    output::source_errors(&errors);

    if body.is_empty() {
        output::error("No captures found");
        return Ok(());
    }
    std::io::stdout()
        .lock()
        .write_all(body.as_bytes())
        .context("Failed to write results")?;
    Ok(())
}
