//! Command dispatch logic for gh-harvest

use super::{
    api_call, collect_paths, fetch_content, fetch_history, fetch_metadata, ApiArgs,
    CollectPathsArgs, FetchContentArgs, FetchHistoryArgs, FetchMetadataArgs,
};
use crate::{Host, Result};
use clap::builder::styling::{AnsiColor, Effects};
use clap::builder::Styles;
use clap::{Parser, Subcommand};

const CLAP_STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[derive(Parser, Debug)]
#[command(name = "gh-harvest", version, about, author)]
#[command(styles = CLAP_STYLES)]
struct Cli {
    #[command(subcommand)]
    command: HarvestSubcommand,
}

#[derive(Subcommand, Debug)]
enum HarvestSubcommand {
    /// Enumerate all files matching a code-search query
    CollectPaths(Box<CollectPathsArgs>),
    /// Download content for collected file paths
    FetchContent(Box<FetchContentArgs>),
    /// Fetch repository metadata for collected files
    FetchMetadata(Box<FetchMetadataArgs>),
    /// Fetch commit history for collected files
    FetchHistory(Box<FetchHistoryArgs>),
    /// Make a generic cached API call
    Api(Box<ApiArgs>),
}

/// Dispatch command-line arguments to the appropriate handler
///
/// This function parses the command-line arguments and executes the
/// corresponding subcommand. It's designed to be called from main.rs
/// with the program arguments.
///
/// # Errors
///
/// Returns an error if command parsing fails or if the executed command
/// fails.
pub async fn run<I, T, H>(host: &mut H, args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
    H: Host,
{
    match &Cli::parse_from(args).command {
        HarvestSubcommand::CollectPaths(args) => collect_paths(host, args).await,
        HarvestSubcommand::FetchContent(args) => fetch_content(host, args).await,
        HarvestSubcommand::FetchMetadata(args) => fetch_metadata(host, args).await,
        HarvestSubcommand::FetchHistory(args) => fetch_history(host, args).await,
        HarvestSubcommand::Api(args) => api_call(host, args).await,
    }
}
