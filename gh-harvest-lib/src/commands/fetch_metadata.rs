//! The fetch-metadata command: repository metadata to a JSON dump.

use super::common::{AppContext, CommonArgs};
use super::Host;
use crate::enrich::{metadata, FetchStrategy};
use crate::Result;
use camino::Utf8PathBuf;
use clap::Args;
use std::io::Write;

/// Fetch repository metadata (stars, forks, license, ...)
#[derive(Args, Debug)]
pub struct FetchMetadataArgs {
    /// Output JSON file (default: <output-dir>/repo_metadata.json)
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<Utf8PathBuf>,

    /// Use the batched GraphQL API (separate rate-limit pool)
    #[arg(long)]
    pub graphql: bool,

    /// Repos per GraphQL query
    #[arg(long, value_name = "N", default_value_t = 50)]
    pub batch_size: usize,

    #[command(flatten)]
    pub common: CommonArgs,
}

pub async fn fetch_metadata<H: Host>(host: &mut H, args: &FetchMetadataArgs) -> Result<()> {
    let ctx = AppContext::new(&args.common)?;
    let store = ctx.open_store(&args.common).await?;

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.common.output_dir.join("repo_metadata.json"));
    let strategy = if args.graphql {
        FetchStrategy::Graphql { batch_size: args.batch_size }
    } else {
        FetchStrategy::Rest
    };

    let stats = metadata::fetch_metadata(
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
