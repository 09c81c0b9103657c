//! Shared flags, logging setup, and context construction.

use crate::client::{
    GraphqlClient, ResponseCache, RestClient, API_BASE, GRAPHQL_REQUESTS_PER_SECOND,
    REST_REQUESTS_PER_SECOND,
};
use crate::error::Error;
use crate::store::Store;
use crate::Result;
use camino::Utf8PathBuf;
use clap::{Args, ValueEnum};
use directories::BaseDirs;
use std::sync::Arc;

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// No logging output
    None,

    /// Only error messages
    Error,

    /// Warning and error messages
    Warn,

    /// Info, warning, and error messages
    Info,

    /// Debug, info, warning, and error messages
    Debug,

    /// Trace, debug, info, warning, and error messages
    Trace,
}

/// Arguments shared by every command
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// GitHub personal access token
    #[arg(long, value_name = "TOKEN", env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// Output directory for results
    #[arg(long, value_name = "PATH", default_value = "results")]
    pub output_dir: Utf8PathBuf,

    /// Database path (default: <output-dir>/files.db)
    #[arg(long, value_name = "PATH")]
    pub db: Option<Utf8PathBuf>,

    /// Directory where API responses are cached
    #[arg(long, value_name = "PATH")]
    pub cache_dir: Option<Utf8PathBuf>,

    /// Skip reading from the cache (still writes to it)
    #[arg(long)]
    pub skip_cache: bool,

    /// Set the logging level for diagnostic output
    #[arg(long, value_name = "LEVEL", default_value = "none")]
    pub log_level: LogLevel,
}

impl CommonArgs {
    #[must_use]
    pub fn db_path(&self) -> Utf8PathBuf {
        self.db
            .clone()
            .unwrap_or_else(|| self.output_dir.join("files.db"))
    }
}

/// Everything a command needs to talk to the host service: the shared
/// response cache and the two throttled clients built over it.
#[derive(Debug)]
pub struct AppContext {
    pub cache: Arc<ResponseCache>,
    pub rest: Arc<RestClient>,
    pub graphql: Arc<GraphqlClient>,
}

impl AppContext {
    /// Build the context from shared flags. Fails fast when the token is
    /// absent or the cache directory cannot be created.
    pub fn new(args: &CommonArgs) -> Result<Self> {
        init_logging(args.log_level);

        let token = args
            .github_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Config("GITHUB_TOKEN is not set".to_string()))?;

        let cache_dir = match &args.cache_dir {
            Some(dir) => dir.as_std_path().to_path_buf(),
            None => BaseDirs::new()
                .ok_or_else(|| Error::Config("could not determine cache directory".to_string()))?
                .cache_dir()
                .join("gh-harvest"),
        };

        let cache = Arc::new(ResponseCache::open(cache_dir, args.skip_cache)?);
        let rest = Arc::new(RestClient::new(
            token,
            API_BASE,
            Arc::clone(&cache),
            REST_REQUESTS_PER_SECOND,
        )?);
        let graphql = Arc::new(GraphqlClient::new(
            token,
            API_BASE,
            Arc::clone(&cache),
            GRAPHQL_REQUESTS_PER_SECOND,
        )?);

        Ok(Self { cache, rest, graphql })
    }

    pub async fn open_store(&self, args: &CommonArgs) -> Result<Store> {
        Store::open(args.db_path().as_std_path()).await
    }
}

/// Initialize the logger based on the log level
fn init_logging(log_level: LogLevel) {
    let level = match log_level {
        LogLevel::None => return,
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env = env_logger::Env::default().filter_or("RUST_LOG", level);

    let _ = env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(matches!(log_level, LogLevel::Debug | LogLevel::Trace))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(token: Option<&str>) -> CommonArgs {
        CommonArgs {
            github_token: token.map(str::to_string),
            output_dir: Utf8PathBuf::from("results"),
            db: None,
            cache_dir: Some(Utf8PathBuf::from_path_buf(std::env::temp_dir().join("ghh-test-cache")).unwrap()),
            skip_cache: false,
            log_level: LogLevel::None,
        }
    }

    #[test]
    fn missing_token_is_a_config_error() {
        let err = AppContext::new(&args(None)).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");

        let err = AppContext::new(&args(Some(""))).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[test]
    fn context_builds_with_token() {
        let ctx = AppContext::new(&args(Some("token"))).unwrap();
        assert!(!ctx.cache.dir().as_os_str().is_empty());
    }

    #[test]
    fn db_path_defaults_under_output_dir() {
        let a = args(Some("t"));
        assert_eq!(a.db_path(), Utf8PathBuf::from("results/files.db"));

        let mut a = args(Some("t"));
        a.db = Some(Utf8PathBuf::from("/tmp/other.db"));
        assert_eq!(a.db_path(), Utf8PathBuf::from("/tmp/other.db"));
    }
}
