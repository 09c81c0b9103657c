//! Throttled client for the GitHub GraphQL API.
//!
//! GraphQL traffic rides a separate rate-limit pool from REST, so this
//! client owns its own pacer. Batched enrichment queries go through
//! [`GraphqlClient::execute`] and manage their own per-item cache
//! entries; the generic [`GraphqlClient::graphql`] entry point caches
//! whole response bodies under the wrapped schema.

use super::cache::{ResponseCache, WrappedEntry};
use super::pacer::Pacer;
use crate::error::Error;
use crate::Result;
use chrono::Utc;
use core::time::Duration;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use std::sync::Arc;

const LOG_TARGET: &str = "   graphql";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Attempts for 5xx/network failures and no-data error bodies.
const TRANSIENT_MAX_ATTEMPTS: u32 = 5;

const TRANSIENT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Fallback wait when a RATE_LIMITED error carries no Retry-After.
const RATE_LIMIT_FALLBACK_SECS: u64 = 60;

const MAX_RATE_LIMIT_WAIT_SECS: u64 = 3600;

#[derive(Debug)]
pub struct GraphqlClient {
    http: reqwest::Client,
    url: String,
    cache: Arc<ResponseCache>,
    pacer: Arc<Pacer>,
}

impl GraphqlClient {
    /// Create a client posting to `{base_url}/graphql`.
    pub fn new(
        token: &str,
        base_url: impl Into<String>,
        cache: Arc<ResponseCache>,
        requests_per_second: f64,
    ) -> Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("bearer {token}"))
            .map_err(|e| Error::Config(format!("invalid GITHUB_TOKEN: {e}")))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        let _ = headers.insert(AUTHORIZATION, auth);
        let _ = headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .user_agent("gh-harvest")
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let base = base_url.into();
        Ok(Self {
            http,
            url: format!("{}/graphql", base.trim_end_matches('/')),
            cache,
            pacer: Pacer::new(requests_per_second),
        })
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Execute a query with throttling and retries. No response caching;
    /// batched callers key their own per-item entries.
    ///
    /// Bodies whose only errors are `RATE_LIMITED` pause and retry
    /// without bound. Other no-data error bodies are retried a bounded
    /// number of times and then returned as-is so the caller can map
    /// per-alias errors.
    pub async fn execute(&self, query: &str, variables: Option<&Value>) -> Result<Value> {
        let mut payload = json!({ "query": query });
        if let Some(vars) = variables {
            payload["variables"] = vars.clone();
        }

        let mut transient_attempts = 0u32;
        let mut rate_limit_attempts = 0u32;

        loop {
            self.pacer.acquire().await;

            let resp = match self.http.post(self.url.as_str()).json(&payload).send().await {
                Ok(r) => r,
                Err(e) => {
                    transient_attempts += 1;
                    if transient_attempts >= TRANSIENT_MAX_ATTEMPTS {
                        return Err(Error::RetriesExhausted {
                            what: format!("POST graphql: {e}"),
                            attempts: transient_attempts,
                        });
                    }
                    let delay = TRANSIENT_BASE_DELAY * 2u32.pow(transient_attempts - 1);
                    log::debug!(target: LOG_TARGET, "Network failure ({e}), retry {transient_attempts}/{TRANSIENT_MAX_ATTEMPTS} in {}s", delay.as_secs());
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = resp.status().as_u16();
            let headers = resp.headers().clone();

            if status == 200 {
                let body: Value = match resp.json().await {
                    Ok(b) => b,
                    Err(e) => {
                        transient_attempts += 1;
                        if transient_attempts >= TRANSIENT_MAX_ATTEMPTS {
                            return Err(Error::RetriesExhausted {
                                what: format!("POST graphql: invalid body: {e}"),
                                attempts: transient_attempts,
                            });
                        }
                        tokio::time::sleep(TRANSIENT_BASE_DELAY * 2u32.pow(transient_attempts - 1)).await;
                        continue;
                    }
                };

                let has_data = !body.get("data").unwrap_or(&Value::Null).is_null();
                if !has_data && has_error_type(&body, "RATE_LIMITED") {
                    let wait = retry_after_secs(&headers)
                        .unwrap_or_else(|| {
                            RATE_LIMIT_FALLBACK_SECS.saturating_mul(1 << rate_limit_attempts.min(6))
                        })
                        .min(MAX_RATE_LIMIT_WAIT_SECS);
                    rate_limit_attempts += 1;
                    log::warn!(target: LOG_TARGET, "Rate limited (200 body), waiting {wait}s");
                    let _ = self.pacer.pause_for(Duration::from_secs(wait));
                    continue;
                }

                if !has_data && is_query_rejection(&body) {
                    // The query itself was rejected (complexity, node
                    // limits); retrying cannot help. The caller decides
                    // whether to split the batch.
                    return Ok(body);
                }

                if !has_data && body.get("errors").is_some() {
                    transient_attempts += 1;
                    if transient_attempts >= TRANSIENT_MAX_ATTEMPTS {
                        // The caller maps per-alias errors; hand the body
                        // back instead of failing the whole pass.
                        log::warn!(target: LOG_TARGET, "GraphQL errors with no data after {transient_attempts} attempts");
                        return Ok(body);
                    }
                    log::debug!(target: LOG_TARGET, "GraphQL errors with no data, retry {transient_attempts}/{TRANSIENT_MAX_ATTEMPTS}");
                    tokio::time::sleep(TRANSIENT_BASE_DELAY * 2u32.pow(transient_attempts - 1)).await;
                    continue;
                }

                return Ok(body);
            }

            if status == 429 || status == 403 {
                let wait = retry_after_secs(&headers)
                    .unwrap_or_else(|| {
                        RATE_LIMIT_FALLBACK_SECS.saturating_mul(1 << rate_limit_attempts.min(6))
                    })
                    .min(MAX_RATE_LIMIT_WAIT_SECS);
                rate_limit_attempts += 1;
                log::warn!(target: LOG_TARGET, "HTTP {status}, waiting {wait}s");
                let _ = self.pacer.pause_for(Duration::from_secs(wait));
                continue;
            }

            if status >= 500 {
                transient_attempts += 1;
                if transient_attempts >= TRANSIENT_MAX_ATTEMPTS {
                    return Err(Error::RetriesExhausted {
                        what: format!("POST graphql: HTTP {status}"),
                        attempts: transient_attempts,
                    });
                }
                let delay = TRANSIENT_BASE_DELAY * 2u32.pow(transient_attempts - 1);
                log::debug!(target: LOG_TARGET, "HTTP {status}, retry {transient_attempts}/{TRANSIENT_MAX_ATTEMPTS} in {}s", delay.as_secs());
                tokio::time::sleep(delay).await;
                continue;
            }

            let message = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                status,
                endpoint: "graphql".to_string(),
                message: message.chars().take(200).collect(),
            });
        }
    }

    /// Execute an arbitrary query with whole-response caching.
    ///
    /// Only bodies carrying non-null `data` are cached; error-only bodies
    /// are returned but never stored.
    pub async fn graphql(
        &self,
        query: &str,
        variables: Option<&Value>,
        skip_cache: bool,
    ) -> Result<Value> {
        let params = cache_params(query, variables);

        if !skip_cache {
            if let Some(entry) = self.cache.load_wrapped("graphql", &params, None, None) {
                return Ok(entry.body);
            }
        }

        let body = self.execute(query, variables).await?;
        if !body.get("data").unwrap_or(&Value::Null).is_null() {
            self.cache.save_wrapped(
                "graphql",
                &params,
                None,
                None,
                &WrappedEntry {
                    status: 200,
                    body: body.clone(),
                    etag: None,
                    link: None,
                    stored_at: Utc::now(),
                },
            );
        }
        Ok(body)
    }
}

fn cache_params(query: &str, variables: Option<&Value>) -> Vec<(String, String)> {
    vec![
        ("query".to_string(), query.to_string()),
        (
            "variables".to_string(),
            variables.map_or_else(|| "{}".to_string(), Value::to_string),
        ),
    ]
}

fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Whether the errors describe the query itself rather than a transient
/// condition.
fn is_query_rejection(body: &Value) -> bool {
    body.get("errors")
        .and_then(Value::as_array)
        .is_some_and(|errors| {
            errors.iter().any(|e| {
                matches!(
                    e.get("type").and_then(Value::as_str),
                    Some("MAX_NODE_LIMIT_EXCEEDED" | "EXCESSIVE_PAGINATION")
                ) || e
                    .get("message")
                    .and_then(Value::as_str)
                    .is_some_and(|m| m.to_ascii_lowercase().contains("complexity"))
            })
        })
}

/// Whether the body's `errors` array contains an error of `error_type`.
fn has_error_type(body: &Value, error_type: &str) -> bool {
    body.get("errors")
        .and_then(Value::as_array)
        .is_some_and(|errors| {
            errors
                .iter()
                .any(|e| e.get("type").and_then(Value::as_str) == Some(error_type))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_RPS: f64 = 10_000.0;

    fn client_for(server: &MockServer, dir: &std::path::Path) -> GraphqlClient {
        let cache = Arc::new(ResponseCache::open(dir, false).unwrap());
        GraphqlClient::new("test-token", server.uri(), cache, TEST_RPS).unwrap()
    }

    #[tokio::test]
    async fn execute_returns_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"r0": {"stargazerCount": 5}}})),
            )
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());

        let body = client.execute("query { }", None).await.unwrap();
        assert_eq!(body["data"]["r0"]["stargazerCount"], 5);
    }

    #[tokio::test]
    async fn graphql_caches_successful_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"viewer": {}}})))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());

        let first = client.graphql("query { viewer { login } }", None, false).await.unwrap();
        let second = client.graphql("query { viewer { login } }", None, false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(client.cache().stats().hits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_only_bodies_are_returned_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": null,
                "errors": [{"type": "SOME_ERROR", "message": "boom"}]
            })))
            .expect(10)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());

        // Bounded retries per call (5), then the body comes back; nothing
        // is written to the cache so the second call hits upstream again.
        let body = client.graphql("query { x }", None, false).await.unwrap();
        assert!(body["data"].is_null());
        let body = client.graphql("query { x }", None, false).await.unwrap();
        assert!(body["data"].is_null());
        assert_eq!(client.cache().stats().hits(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_error_type_pauses_and_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": null, "errors": [{"type": "RATE_LIMITED"}]})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"ok": 1}})))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());

        let start = tokio::time::Instant::now();
        let body = client.execute("query { x }", None).await.unwrap();
        assert_eq!(body["data"]["ok"], 1);
        // First rate-limit wait without hints is the 60s base.
        assert!(start.elapsed() >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn http_429_with_retry_after_waits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "10"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"ok": 1}})))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());

        let start = tokio::time::Instant::now();
        let body = client.execute("query { x }", None).await.unwrap();
        assert_eq!(body["data"]["ok"], 1);
        assert!(start.elapsed() >= Duration::from_secs(9));
    }

    #[tokio::test]
    async fn query_rejections_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": null,
                "errors": [{"message": "Query has complexity 60000, exceeding the maximum"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());

        let body = client.execute("query { huge }", None).await.unwrap();
        assert!(body["data"].is_null());
    }

    #[test]
    fn error_type_detection() {
        let body = json!({"errors": [{"type": "RATE_LIMITED"}]});
        assert!(has_error_type(&body, "RATE_LIMITED"));
        assert!(!has_error_type(&body, "NOT_FOUND"));
        assert!(!has_error_type(&json!({}), "RATE_LIMITED"));
    }
}
