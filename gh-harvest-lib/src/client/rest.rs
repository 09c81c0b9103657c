//! Cached, throttled client for the GitHub REST API.

use super::cache::{ResponseCache, WrappedEntry};
use super::pacer::Pacer;
use crate::error::Error;
use crate::Result;
use chrono::Utc;
use core::time::Duration;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;

const LOG_TARGET: &str = "      rest";

/// Default API base; tests point this at a local mock server.
pub const API_BASE: &str = "https://api.github.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Total attempts for 5xx and network failures before surfacing the error.
const TRANSIENT_MAX_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff on transient failures.
const TRANSIENT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Backoff start when a rate-limit response carries no reset hint.
const RATE_LIMIT_BASE_DELAY_SECS: u64 = 60;

/// Upper bound on any single rate-limit wait.
const MAX_RATE_LIMIT_WAIT_SECS: u64 = 3600;

/// A successful (2xx) upstream response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    pub etag: Option<String>,
    pub link: Option<String>,
}

impl From<WrappedEntry> for ApiResponse {
    fn from(entry: WrappedEntry) -> Self {
        Self {
            status: entry.status,
            body: entry.body,
            etag: entry.etag,
            link: entry.link,
        }
    }
}

/// How one attempt resolved.
enum Disposition {
    Success(ApiResponse),
    RateLimited(Duration),
    Transient(String),
    Permanent { status: u16, message: String },
}

/// The single throttled channel to the REST API.
///
/// Rate-limit responses pause the pacer and retry without bound; 5xx and
/// network errors retry with bounded exponential backoff; other client
/// errors surface immediately. Cache hits never consume a pacing slot.
#[derive(Debug)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    cache: Arc<ResponseCache>,
    pacer: Arc<Pacer>,
}

impl RestClient {
    /// Create a client authenticated with `token`.
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
        let _ = headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));

        let http = reqwest::Client::builder()
            .user_agent("gh-harvest")
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            cache,
            pacer: Pacer::new(requests_per_second),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Make a GET call through the wrapped-schema cache.
    ///
    /// `skip_cache` short-circuits the read but not the write, so the
    /// fresh response populates the entry for the next caller.
    pub async fn api(
        &self,
        endpoint: &str,
        params: &[(String, String)],
        skip_cache: bool,
    ) -> Result<ApiResponse> {
        if !skip_cache {
            if let Some(entry) = self.cache.load_wrapped(endpoint, params, None, None) {
                return Ok(entry.into());
            }
        }

        let resp = self.execute(Method::GET, endpoint, params).await?;
        self.cache.save_wrapped(
            endpoint,
            params,
            None,
            None,
            &WrappedEntry {
                status: resp.status,
                body: resp.body.clone(),
                etag: resp.etag.clone(),
                link: resp.link.clone(),
                stored_at: Utc::now(),
            },
        );
        Ok(resp)
    }

    /// Make a non-GET call. Bypasses the cache in both directions.
    pub async fn api_with_method(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<ApiResponse> {
        self.execute(method, endpoint, params).await
    }

    /// Make a GET call with throttling and retries but no wrapped-cache
    /// interaction. Call sites that key their own bare-schema entries
    /// (search pages, blob contents, commit lists) use this path.
    pub async fn api_uncached(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<ApiResponse> {
        self.execute(Method::GET, endpoint, params).await
    }

    fn url_for(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    async fn execute(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<ApiResponse> {
        let url = self.url_for(endpoint);
        let mut transient_attempts = 0u32;
        let mut rate_limit_attempts = 0u32;

        loop {
            self.pacer.acquire().await;

            let mut request = self.http.request(method.clone(), url.as_str());
            if !params.is_empty() {
                request = request.query(params);
            }

            let disposition = match request.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let headers = resp.headers().clone();
                    match resp.text().await {
                        Ok(text) => classify(status, &headers, &text, rate_limit_attempts),
                        Err(e) => Disposition::Transient(format!("reading body: {e}")),
                    }
                }
                Err(e) => Disposition::Transient(e.to_string()),
            };

            match disposition {
                Disposition::Success(resp) => {
                    log::debug!(target: LOG_TARGET, "HTTP {} for {method} {endpoint}", resp.status);
                    return Ok(resp);
                }
                Disposition::RateLimited(wait) => {
                    rate_limit_attempts += 1;
                    log::warn!(
                        target: LOG_TARGET,
                        "Rate limited on {method} {endpoint}, waiting {}s (hit {rate_limit_attempts})",
                        wait.as_secs()
                    );
                    let _ = self.pacer.pause_for(wait);
                }
                Disposition::Transient(reason) => {
                    transient_attempts += 1;
                    if transient_attempts >= TRANSIENT_MAX_ATTEMPTS {
                        return Err(Error::RetriesExhausted {
                            what: format!("{method} {endpoint}: {reason}"),
                            attempts: transient_attempts,
                        });
                    }
                    let delay = TRANSIENT_BASE_DELAY * 2u32.pow(transient_attempts - 1);
                    log::debug!(
                        target: LOG_TARGET,
                        "Transient failure on {method} {endpoint} ({reason}), retry {transient_attempts}/{TRANSIENT_MAX_ATTEMPTS} in {}s",
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                }
                Disposition::Permanent { status, message } => {
                    return Err(Error::Api {
                        status,
                        endpoint: endpoint.to_string(),
                        message,
                    });
                }
            }
        }
    }
}

/// Classify one HTTP response.
fn classify(status: u16, headers: &HeaderMap, text: &str, rate_limit_attempts: u32) -> Disposition {
    if (200..300).contains(&status) {
        let body = if text.is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            match serde_json::from_str(text) {
                Ok(v) => v,
                // A cut-off or mangled body on a success status is most
                // likely a connection problem; retry.
                Err(e) => return Disposition::Transient(format!("invalid JSON body: {e}")),
            }
        };
        return Disposition::Success(ApiResponse {
            status,
            body,
            etag: header_string(headers, "etag"),
            link: header_string(headers, "link"),
        });
    }

    if status == 429 || (status == 403 && is_rate_limited(headers, text)) {
        return Disposition::RateLimited(rate_limit_wait(headers, rate_limit_attempts));
    }

    if status >= 500 {
        return Disposition::Transient(format!("HTTP {status}"));
    }

    Disposition::Permanent {
        status,
        message: text.chars().take(200).collect(),
    }
}

/// Whether a 403 is a rate-limit signal rather than a permission error.
fn is_rate_limited(headers: &HeaderMap, text: &str) -> bool {
    if headers.contains_key(reqwest::header::RETRY_AFTER) {
        return true;
    }
    if header_u64(headers, "x-ratelimit-remaining") == Some(0) {
        return true;
    }
    text.to_ascii_lowercase().contains("rate limit")
}

/// How long to wait before retrying a rate-limited request.
///
/// Honors `Retry-After`, then the remaining primary-limit window from
/// `x-ratelimit-reset`, then exponential backoff starting at 60s. Every
/// wait is capped at one hour.
fn rate_limit_wait(headers: &HeaderMap, attempt: u32) -> Duration {
    let secs = if let Some(retry_after) = header_u64(headers, "retry-after") {
        retry_after
    } else if let Some(reset) = header_u64(headers, "x-ratelimit-reset") {
        let now = Utc::now().timestamp().max(0).unsigned_abs();
        reset.saturating_sub(now).max(1)
    } else {
        RATE_LIMIT_BASE_DELAY_SECS.saturating_mul(1 << attempt.min(6))
    };
    Duration::from_secs(secs.min(MAX_RATE_LIMIT_WAIT_SECS))
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name)?.to_str().ok().map(str::to_string)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}
