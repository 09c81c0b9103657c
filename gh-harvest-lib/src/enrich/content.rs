//! File content pass: download every discovered file's raw text.
//!
//! Output is one file per record under
//! `content/<owner>/<repo>/blob/<ref>/<path>`. Presence on disk is
//! authoritative: a bulk pre-scan marks anything already downloaded as
//! done without an API call, and per-item outcomes land in the store's
//! `content_status` table so re-runs only look at genuinely new work.

use super::batch::{build_blob_query, is_complexity_error};
use super::{FetchStrategy, PassStats};
use crate::client::{GraphqlClient, ResponseCache, RestClient};
use crate::ghurl;
use crate::store::{FileRecord, Store};
use crate::Result;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

const LOG_TARGET: &str = "   content";

const CACHE_ENDPOINT: &str = "contents";

/// Hop limit when following relative symlinks through the contents API.
const MAX_SYMLINK_HOPS: u32 = 5;

/// How many statuses accumulate before being flushed to the store.
const STATUS_FLUSH_EVERY: usize = 100;

/// Terminal outcome for one file. Truncated GraphQL blobs never become
/// an outcome; they are queued separately for the REST fallback.
enum ContentOutcome {
    Text(String),
    NotFound,
    NoContent,
    UnresolvableSymlink,
}

fn cache_params(owner: &str, repo: &str, path: &str, git_ref: &str) -> Vec<(String, String)> {
    vec![
        ("owner".to_string(), owner.to_string()),
        ("repo".to_string(), repo.to_string()),
        ("path".to_string(), path.to_string()),
        ("ref".to_string(), git_ref.to_string()),
    ]
}

/// Decode GitHub's newline-riddled base64 into lossy UTF-8 text.
fn decode_content(b64: &str) -> Result<String> {
    let cleaned: String = b64.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = B64.decode(cleaned.as_bytes())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Interpret a cached entry. `None` means the entry is unusable and the
/// item should be fetched fresh.
fn outcome_from_cache(value: &Value) -> Option<ContentOutcome> {
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Some(match error {
            "no_content" => ContentOutcome::NoContent,
            "unresolvable_symlink" => ContentOutcome::UnresolvableSymlink,
            _ => ContentOutcome::NotFound,
        });
    }
    let b64 = value.get("content").and_then(Value::as_str)?;
    decode_content(b64).ok().map(ContentOutcome::Text)
}

/// Fetch one file through the REST contents API, following relative
/// symlinks and caching terminal outcomes under the immutable schema.
async fn rest_fetch(
    rest: &RestClient,
    cache: &ResponseCache,
    owner: &str,
    repo: &str,
    path: &str,
    git_ref: &str,
) -> Result<ContentOutcome> {
    let mut current = path.to_string();

    for _ in 0..MAX_SYMLINK_HOPS {
        let params = cache_params(owner, repo, &current, git_ref);
        if let Some(cached) = cache.load_bare(CACHE_ENDPOINT, &params) {
            if let Some(outcome) = outcome_from_cache(&cached) {
                return Ok(outcome);
            }
        }

        let endpoint = format!("repos/{owner}/{repo}/contents/{current}");
        let resp = match rest
            .api_uncached(&endpoint, &[("ref".to_string(), git_ref.to_string())])
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.status() == Some(404) => {
                cache.save_bare(CACHE_ENDPOINT, &params, &json!({"error": "not_found"}));
                return Ok(ContentOutcome::NotFound);
            }
            Err(e) => return Err(e),
        };

        // A directory listing means the path is not a file.
        if resp.body.is_array() {
            return Ok(ContentOutcome::NotFound);
        }

        if resp.body.get("type").and_then(Value::as_str) == Some("symlink") {
            let resolved = resp
                .body
                .get("target")
                .and_then(Value::as_str)
                .filter(|t| !t.starts_with('/'))
                .and_then(|t| ghurl::resolve_symlink(&current, t));
            match resolved {
                Some(next) => {
                    current = next;
                    continue;
                }
                None => {
                    cache.save_bare(
                        CACHE_ENDPOINT,
                        &params,
                        &json!({"error": "unresolvable_symlink"}),
                    );
                    return Ok(ContentOutcome::UnresolvableSymlink);
                }
            }
        }

        let Some(b64) = resp
            .body
            .get("content")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
        else {
            cache.save_bare(CACHE_ENDPOINT, &params, &json!({"error": "no_content"}));
            return Ok(ContentOutcome::NoContent);
        };

        cache.save_bare(
            CACHE_ENDPOINT,
            &params,
            &json!({
                "content": b64,
                "encoding": "base64",
                "sha": resp.body.get("sha"),
                "size": resp.body.get("size"),
                "name": resp.body.get("name"),
                "path": resp.body.get("path"),
            }),
        );
        return Ok(ContentOutcome::Text(decode_content(b64)?));
    }

    log::warn!(target: LOG_TARGET, "Symlink chain too deep for {owner}/{repo}/{path}");
    Ok(ContentOutcome::UnresolvableSymlink)
}

/// Bulk pre-scan of the content directory. One directory walk beats a
/// per-file existence probe once the tree holds tens of thousands of
/// entries.
fn scan_existing(content_dir: &Path) -> HashSet<PathBuf> {
    let mut existing = HashSet::new();
    if !content_dir.exists() {
        return existing;
    }
    for entry in WalkDir::new(content_dir).into_iter().filter_map(std::result::Result::ok) {
        if entry.file_type().is_file() {
            if let Ok(rel) = entry.path().strip_prefix(content_dir) {
                let _ = existing.insert(rel.to_path_buf());
            }
        }
    }
    existing
}

fn write_output(content_dir: &Path, record: &FileRecord, text: &str) -> Result<()> {
    let rel = ghurl::content_rel_path(&record.owner, &record.repo, &record.git_ref, &record.path);
    let path = content_dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, text)?;
    Ok(())
}

fn apply_outcome(
    content_dir: &Path,
    record: &FileRecord,
    outcome: &ContentOutcome,
    stats: &mut PassStats,
    statuses: &mut Vec<(String, String)>,
) {
    let status = match outcome {
        ContentOutcome::Text(text) => match write_output(content_dir, record, text) {
            Ok(()) => {
                stats.fetched += 1;
                "fetched"
            }
            Err(e) => {
                log::warn!(target: LOG_TARGET, "Could not write {}: {e:#}", record.url);
                stats.errors += 1;
                "error"
            }
        },
        ContentOutcome::NotFound
        | ContentOutcome::NoContent
        | ContentOutcome::UnresolvableSymlink => {
            stats.not_found += 1;
            "not_found"
        }
    };
    statuses.push((record.url.clone(), status.to_string()));
}

/// Run the content pass over every file lacking a content status.
pub async fn fetch_content(
    rest: &Arc<RestClient>,
    graphql: &Arc<GraphqlClient>,
    store: &Store,
    content_dir: &Path,
    strategy: FetchStrategy,
) -> Result<PassStats> {
    fs::create_dir_all(content_dir)?;
    let cache = rest.cache();

    let all_pending = store.files_without_content().await?;
    let total = store.file_count().await?;
    log::info!(
        target: LOG_TARGET,
        "Fetching content for {} files ({} already done)",
        all_pending.len(),
        total - all_pending.len() as u64
    );

    let mut stats = PassStats::default();
    let mut statuses: Vec<(String, String)> = Vec::new();

    // Anything already on disk is done, no API call needed.
    let existing = scan_existing(content_dir);
    let mut pending = Vec::new();
    for record in all_pending {
        let rel =
            ghurl::content_rel_path(&record.owner, &record.repo, &record.git_ref, &record.path);
        if existing.contains(&rel) {
            stats.skipped += 1;
            statuses.push((record.url.clone(), "fetched".to_string()));
        } else {
            pending.push(record);
        }
    }
    store.record_content_status(&statuses).await?;
    statuses.clear();

    match strategy {
        FetchStrategy::Rest => {
            for record in &pending {
                match rest_fetch(
                    rest,
                    cache,
                    &record.owner,
                    &record.repo,
                    &record.path,
                    &record.git_ref,
                )
                .await
                {
                    Ok(outcome) => {
                        apply_outcome(content_dir, record, &outcome, &mut stats, &mut statuses);
                    }
                    Err(e) => {
                        log::warn!(target: LOG_TARGET, "Could not fetch {}: {e:#}", record.url);
                        stats.errors += 1;
                        statuses.push((record.url.clone(), "error".to_string()));
                    }
                }
                if statuses.len() >= STATUS_FLUSH_EVERY {
                    store.record_content_status(&statuses).await?;
                    statuses.clear();
                }
            }
        }
        FetchStrategy::Graphql { batch_size } => {
            let truncated = graphql_pass(
                graphql,
                cache,
                store,
                content_dir,
                &pending,
                batch_size.max(1),
                &mut stats,
                &mut statuses,
            )
            .await?;

            // Truncated blobs (>~100KB) are only available over REST.
            for record in &truncated {
                match rest_fetch(
                    rest,
                    cache,
                    &record.owner,
                    &record.repo,
                    &record.path,
                    &record.git_ref,
                )
                .await
                {
                    Ok(ContentOutcome::Text(text)) => {
                        match write_output(content_dir, record, &text) {
                            Ok(()) => {
                                stats.truncated_rest += 1;
                                statuses.push((record.url.clone(), "fetched".to_string()));
                            }
                            Err(e) => {
                                log::warn!(target: LOG_TARGET, "Could not write {}: {e:#}", record.url);
                                stats.errors += 1;
                                statuses.push((record.url.clone(), "error".to_string()));
                            }
                        }
                    }
                    Ok(_) => {
                        stats.not_found += 1;
                        statuses.push((record.url.clone(), "not_found".to_string()));
                    }
                    Err(e) => {
                        log::warn!(target: LOG_TARGET, "Could not fetch {}: {e:#}", record.url);
                        stats.errors += 1;
                        statuses.push((record.url.clone(), "error".to_string()));
                    }
                }
            }
        }
    }

    store.record_content_status(&statuses).await?;
    Ok(stats)
}

/// Batched GraphQL strategy. Returns the records whose blobs came back
/// truncated and need the REST fallback.
#[expect(clippy::too_many_arguments, reason = "internal helper for one pass")]
async fn graphql_pass(
    graphql: &GraphqlClient,
    cache: &ResponseCache,
    store: &Store,
    content_dir: &Path,
    pending: &[FileRecord],
    batch_size: usize,
    stats: &mut PassStats,
    statuses: &mut Vec<(String, String)>,
) -> Result<Vec<FileRecord>> {
    let mut truncated = Vec::new();
    let mut queue: VecDeque<Vec<FileRecord>> =
        pending.chunks(batch_size).map(<[FileRecord]>::to_vec).collect();

    while let Some(batch) = queue.pop_front() {
        // Resolve what the cache already knows.
        let mut uncached = Vec::new();
        for record in batch {
            let params =
                cache_params(&record.owner, &record.repo, &record.path, &record.git_ref);
            match cache
                .load_bare(CACHE_ENDPOINT, &params)
                .as_ref()
                .and_then(outcome_from_cache)
            {
                Some(outcome) => {
                    apply_outcome(content_dir, &record, &outcome, stats, statuses);
                }
                None => uncached.push(record),
            }
        }
        if uncached.is_empty() {
            continue;
        }

        let blob_query = build_blob_query(&uncached);
        let body = graphql.execute(&blob_query.query, None).await?;
        stats.queries += 1;

        if is_complexity_error(&body) {
            if uncached.len() > 1 {
                let mid = uncached.len() / 2;
                let back = uncached.split_off(mid);
                log::info!(
                    target: LOG_TARGET,
                    "Query complexity rejected, splitting batch into {} + {}",
                    uncached.len(),
                    back.len()
                );
                queue.push_front(back);
                queue.push_front(uncached);
            } else {
                let record = &uncached[0];
                log::warn!(target: LOG_TARGET, "Single-item query rejected for complexity: {}", record.url);
                stats.errors += 1;
                statuses.push((record.url.clone(), "error".to_string()));
            }
            continue;
        }

        let data = body.get("data").cloned().unwrap_or(Value::Null);
        for (i, record) in uncached.iter().enumerate() {
            let (repo_alias, file_alias) = &blob_query.aliases[i];
            let params =
                cache_params(&record.owner, &record.repo, &record.path, &record.git_ref);

            let blob = data
                .get(repo_alias)
                .filter(|repo| !repo.is_null())
                .and_then(|repo| repo.get(file_alias))
                .filter(|blob| !blob.is_null());

            let Some(blob) = blob else {
                // Repository or object missing at that ref:path.
                cache.save_bare(CACHE_ENDPOINT, &params, &json!({"error": "not_found"}));
                apply_outcome(content_dir, record, &ContentOutcome::NotFound, stats, statuses);
                continue;
            };

            if blob.get("isTruncated").and_then(Value::as_bool) == Some(true) {
                // Not cached: the REST fallback will write the real entry.
                truncated.push(record.clone());
                continue;
            }

            let Some(text) = blob.get("text").and_then(Value::as_str) else {
                // Binary blob, or empty.
                cache.save_bare(CACHE_ENDPOINT, &params, &json!({"error": "no_content"}));
                apply_outcome(content_dir, record, &ContentOutcome::NoContent, stats, statuses);
                continue;
            };

            cache.save_bare(
                CACHE_ENDPOINT,
                &params,
                &json!({
                    "content": B64.encode(text.as_bytes()),
                    "encoding": "base64",
                    "size": blob.get("byteSize"),
                    "path": record.path,
                }),
            );
            apply_outcome(
                content_dir,
                record,
                &ContentOutcome::Text(text.to_string()),
                stats,
                statuses,
            );
        }

        store.record_content_status(statuses).await?;
        statuses.clear();
    }

    Ok(truncated)
}
