//! The api command: a generic cached call with the response on stdout.

use super::common::{AppContext, CommonArgs};
use super::Host;
use crate::error::Error;
use crate::Result;
use clap::Args;
use std::io::Write;
use reqwest::Method;

/// Make a generic cached API call
#[derive(Args, Debug)]
pub struct ApiArgs {
    /// API endpoint path (e.g. "repos/owner/repo"), or a GraphQL query
    /// with --graphql
    pub endpoint: String,

    /// Query parameter (repeatable, e.g. --param per_page=100)
    #[arg(long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,

    /// HTTP method
    #[arg(long, value_name = "METHOD", default_value = "GET")]
    pub method: String,

    /// Treat the endpoint as a GraphQL query
    #[arg(long)]
    pub graphql: bool,

    /// GraphQL query text (with --graphql; defaults to the positional
    /// argument)
    #[arg(long, value_name = "QUERY")]
    pub query: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

pub async fn api_call<H: Host>(host: &mut H, args: &ApiArgs) -> Result<()> {
    let ctx = AppContext::new(&args.common)?;

    if args.graphql {
        let query = args.query.as_deref().unwrap_or(&args.endpoint);
        let body = ctx
            .graphql
            .graphql(query, None, args.common.skip_cache)
            .await?;
        writeln!(host.output(), "{}", serde_json::to_string_pretty(&body)?)?;
        return Ok(());
    }

    let params: Vec<(String, String)> = args
        .params
        .iter()
        .map(|p| {
            let (k, v) = p.split_once('=').unwrap_or((p.as_str(), ""));
            (k.to_string(), v.to_string())
        })
        .collect();

    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| Error::Config(format!("invalid HTTP method '{}'", args.method)))?;

    let resp = if method == Method::GET {
        ctx.rest
            .api(&args.endpoint, &params, args.common.skip_cache)
            .await?
    } else {
        ctx.rest
            .api_with_method(method, &args.endpoint, &params)
            .await?
    };

    writeln!(host.output(), "{}", serde_json::to_string_pretty(&resp.body)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_pairs_split_on_first_equals() {
        let raw = vec!["per_page=100".to_string(), "q=a=b".to_string(), "flag".to_string()];
        let params: Vec<(String, String)> = raw
            .iter()
            .map(|p| {
                let (k, v) = p.split_once('=').unwrap_or((p.as_str(), ""));
                (k.to_string(), v.to_string())
            })
            .collect();
        assert_eq!(params[0], ("per_page".to_string(), "100".to_string()));
        assert_eq!(params[1], ("q".to_string(), "a=b".to_string()));
        assert_eq!(params[2], ("flag".to_string(), String::new()));
    }
}
