//! Command-line interface and orchestration for gh-harvest
//!
//! # Commands
//!
//! - **collect-paths**: enumerate every file matching a code-search
//!   query via the size-sharded scan, into `files.db`
//! - **fetch-content**: download raw file content for collected paths
//! - **fetch-metadata**: fetch repository metadata into a JSON dump
//! - **fetch-history**: fetch per-file commit history into a JSON dump
//! - **api**: make a generic cached API call and print the response body
//!
//! The `run` function parses arguments with clap and routes to the
//! command handlers. Each handler builds an [`common::AppContext`]
//! (cache + throttled clients) from the shared flags, opens whatever
//! stores and output files it needs, and reports a summary through the
//! [`Host`].

mod api;
mod collect_paths;
mod common;
mod fetch_content;
mod fetch_history;
mod fetch_metadata;
mod host;
mod run;

pub use api::{api_call, ApiArgs};
pub use collect_paths::{collect_paths, CollectPathsArgs};
pub use common::{AppContext, CommonArgs, LogLevel};
pub use fetch_content::{fetch_content, FetchContentArgs};
pub use fetch_history::{fetch_history, FetchHistoryArgs};
pub use fetch_metadata::{fetch_metadata, FetchMetadataArgs};
pub use host::Host;
pub use run::run;
