//! Code-search API access with immutable-schema caching.

use crate::client::{ResponseCache, RestClient};
use crate::Result;
use serde_json::Value;
use std::sync::Arc;

const LOG_TARGET: &str = "    search";

/// One row from the code-search API.
#[derive(Debug, Clone)]
pub struct SearchItem {
    pub sha: String,
    pub path: String,
    pub html_url: String,
    pub repo_full_name: String,
}

/// One page of search results plus the host's reported total.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub total_count: u64,
    pub items: Vec<SearchItem>,
}

/// Issues `search/code` queries through the throttled client, caching
/// each page under the bare schema so replaying a scan is nearly free.
#[derive(Debug)]
pub struct SearchApi {
    rest: Arc<RestClient>,
}

impl SearchApi {
    pub fn new(rest: Arc<RestClient>) -> Self {
        Self { rest }
    }

    fn cache(&self) -> &Arc<ResponseCache> {
        self.rest.cache()
    }

    /// Fetch one page of results.
    pub async fn page(&self, query: &str, per_page: u32, page: u32) -> Result<SearchPage> {
        let params = vec![
            ("q".to_string(), query.to_string()),
            ("per_page".to_string(), per_page.to_string()),
            ("page".to_string(), page.to_string()),
        ];

        if let Some(cached) = self.cache().load_bare("search/code", &params) {
            return Ok(parse_page(&cached));
        }

        let resp = match self.rest.api_uncached("search/code", &params).await {
            Ok(resp) => resp,
            // The host reports the pagination limit as 422; treat it as
            // an empty page rather than an error.
            Err(e) if e.status() == Some(422) => {
                log::debug!(target: LOG_TARGET, "Pagination limit reached for page {page}");
                return Ok(SearchPage { total_count: 0, items: Vec::new() });
            }
            Err(e) => return Err(e),
        };

        let parsed = parse_page(&resp.body);

        // Empty later pages are usually transient index hiccups; caching
        // them would make the gap permanent.
        if !parsed.items.is_empty() || page == 1 {
            self.cache().save_bare("search/code", &params, &resp.body);
        }

        Ok(parsed)
    }

    /// The host's reported total for a query, via a minimal page.
    pub async fn total_count(&self, query: &str) -> Result<u64> {
        Ok(self.page(query, 1, 1).await?.total_count)
    }
}

fn parse_page(body: &Value) -> SearchPage {
    let total_count = body
        .get("total_count")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    let items = body
        .get("items")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_item).collect())
        .unwrap_or_default();

    SearchPage { total_count, items }
}

fn parse_item(item: &Value) -> Option<SearchItem> {
    Some(SearchItem {
        sha: item.get("sha")?.as_str()?.to_string(),
        path: item.get("path")?.as_str()?.to_string(),
        html_url: item.get("html_url")?.as_str()?.to_string(),
        repo_full_name: item
            .get("repository")?
            .get("full_name")?
            .as_str()?
            .to_string(),
    })
}
