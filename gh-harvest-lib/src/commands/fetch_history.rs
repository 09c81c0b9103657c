//! The fetch-history command: per-file commit history to a JSON dump.

use super::common::{AppContext, CommonArgs};
use super::Host;
use crate::enrich::{history, FetchStrategy};
use crate::Result;
use camino::Utf8PathBuf;
use clap::Args;
use std::io::Write;

/// Fetch commit history for collected files
#[derive(Args, Debug)]
pub struct FetchHistoryArgs {
    /// Output JSON file (default: <output-dir>/file_history.json)
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<Utf8PathBuf>,

    /// Use the batched GraphQL API (separate rate-limit pool)
    #[arg(long)]
    pub graphql: bool,

    /// Files per GraphQL query. History costs more complexity per item
    /// than content does, hence the smaller default.
    #[arg(long, value_name = "N", default_value_t = 20)]
    pub batch_size: usize,

    #[command(flatten)]
    pub common: CommonArgs,
}

pub async fn fetch_history<H: Host>(host: &mut H, args: &FetchHistoryArgs) -> Result<()> {
    let ctx = AppContext::new(&args.common)?;
    let store = ctx.open_store(&args.common).await?;

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.common.output_dir.join("file_history.json"));
    let strategy = if args.graphql {
        FetchStrategy::Graphql { batch_size: args.batch_size }
    } else {
        FetchStrategy::Rest
    };

    let stats = history::fetch_history(
        &ctx.rest,
        &ctx.graphql,
        &store,
        output.as_std_path(),
        strategy,
    )
    .await?;

    writeln!(
        host.output(),
        "Done: {} fetched, {} skipped, {} not found, {} errors, {} queries",
        stats.fetched,
        stats.skipped,
        stats.not_found,
        stats.errors,
        stats.queries
    )?;
    Ok(())
}
