//! The fetch-content command: download raw file content.

use super::common::{AppContext, CommonArgs};
use super::Host;
use crate::enrich::{content, FetchStrategy};
use crate::Result;
use camino::Utf8PathBuf;
use clap::Args;
use std::io::Write;

/// Download content for collected file paths
#[derive(Args, Debug)]
pub struct FetchContentArgs {
    /// Directory to store content (default: <output-dir>/content)
    #[arg(long, value_name = "PATH")]
    pub content_dir: Option<Utf8PathBuf>,

    /// Use the batched GraphQL API (separate rate-limit pool)
    #[arg(long)]
    pub graphql: bool,

    /// Files per GraphQL query
    #[arg(long, value_name = "N", default_value_t = 50)]
    pub batch_size: usize,

    #[command(flatten)]
    pub common: CommonArgs,
}

pub async fn fetch_content<H: Host>(host: &mut H, args: &FetchContentArgs) -> Result<()> {
    let ctx = AppContext::new(&args.common)?;
    let store = ctx.open_store(&args.common).await?;

    let content_dir = args
        .content_dir
        .clone()
        .unwrap_or_else(|| args.common.output_dir.join("content"));
    let strategy = if args.graphql {
        FetchStrategy::Graphql { batch_size: args.batch_size }
    } else {
        FetchStrategy::Rest
    };

    let stats = content::fetch_content(
        &ctx.rest,
        &ctx.graphql,
        &store,
        content_dir.as_std_path(),
        strategy,
    )
    .await?;

    writeln!(
        host.output(),
        "Done: {} fetched, {} skipped, {} not found, {} errors, {} via REST fallback, {} queries",
        stats.fetched,
        stats.skipped,
        stats.not_found,
        stats.errors,
        stats.truncated_rest,
        stats.queries
    )?;
    Ok(())
}
