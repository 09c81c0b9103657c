//! The collect-paths command: run the size-sharded scan.

use super::common::{AppContext, CommonArgs};
use super::Host;
use crate::error::Error;
use crate::scan::search::SearchApi;
use crate::scan::{ScanConfig, Scanner};
use crate::Result;
use clap::Args;
use std::io::Write;
use std::sync::Arc;

/// Enumerate all files matching a code-search query
#[derive(Args, Debug)]
pub struct CollectPathsArgs {
    /// Search query (e.g. "filename:Cargo.toml language:TOML")
    pub query: String,

    /// Exclusive upper bound of the size axis, in bytes
    #[arg(long, value_name = "BYTES", default_value_t = 1_000_000)]
    pub max_size: u64,

    /// Starting chunk width, in bytes
    #[arg(long, value_name = "BYTES", default_value_t = 100)]
    pub initial_width: u64,

    /// Cap on chunk widening, in bytes
    #[arg(long, value_name = "BYTES", default_value_t = 100_000)]
    pub max_width: u64,

    #[command(flatten)]
    pub common: CommonArgs,
}

pub async fn collect_paths<H: Host>(host: &mut H, args: &CollectPathsArgs) -> Result<()> {
    let ctx = AppContext::new(&args.common)?;
    let store = ctx.open_store(&args.common).await?;

    let scanner = Scanner::new(
        SearchApi::new(Arc::clone(&ctx.rest)),
        ScanConfig {
            max_size: args.max_size.max(1),
            initial_width: args.initial_width.max(1),
            max_width: args.max_width.max(1),
        },
    );

    match scanner.run(&store, &args.query, args.common.skip_cache).await {
        Ok(summary) => {
            writeln!(
                host.output(),
                "Collected {} files in {} chunks ({} reported upstream)",
                summary.collected,
                summary.chunks,
                summary.total_reported
            )?;
            Ok(())
        }
        Err(e @ Error::IrreducibleSaturation { .. }) => {
            writeln!(host.error(), "{e}")?;
            host.exit(2);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
