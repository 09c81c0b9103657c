//! Per-file commit history pass.
//!
//! Each file's commit list (up to 100 commits) is reduced to first/last
//! commit timestamps, the deduplicated author set, and the commit count,
//! and written into one JSON object keyed by file URL. Like the metadata
//! dump, the output is merged with what is already on disk so restarts
//! skip completed files.

use super::batch::{build_history_query, is_complexity_error};
use super::{FetchStrategy, PassStats};
use crate::client::{GraphqlClient, ResponseCache, RestClient};
use crate::store::{FileRecord, Store};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;

const LOG_TARGET: &str = "   history";

const CACHE_ENDPOINT: &str = "file_history";

/// One commit as cached: abbreviated sha, author name, commit date, and
/// the first message line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub sha: String,
    pub author: Option<String>,
    pub date: Option<String>,
    pub message: String,
}

/// The per-file summary that lands in the dump.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileHistorySummary {
    pub first_commit: Option<DateTime<Utc>>,
    pub last_commit: Option<DateTime<Utc>>,
    pub authors: BTreeSet<String>,
    pub commit_count: u64,
}

/// Reduce a commit list to its summary.
#[must_use]
pub fn summarize(commits: &[CommitEntry]) -> FileHistorySummary {
    let dates: Vec<DateTime<Utc>> = commits
        .iter()
        .filter_map(|c| c.date.as_deref())
        .filter_map(|d| DateTime::parse_from_rfc3339(d).ok())
        .map(|d| d.with_timezone(&Utc))
        .collect();

    FileHistorySummary {
        first_commit: dates.iter().min().copied(),
        last_commit: dates.iter().max().copied(),
        authors: commits.iter().filter_map(|c| c.author.clone()).collect(),
        commit_count: commits.len() as u64,
    }
}

fn cache_params(owner: &str, repo: &str, path: &str) -> Vec<(String, String)> {
    vec![
        ("owner".to_string(), owner.to_string()),
        ("repo".to_string(), repo.to_string()),
        ("path".to_string(), path.to_string()),
    ]
}

fn short_sha(sha: &str) -> String {
    sha.chars().take(7).collect()
}

fn first_line_truncated(message: &str) -> String {
    message.lines().next().unwrap_or("").chars().take(80).collect()
}

/// Read an existing dump, tolerating a missing file.
pub fn load_dump(path: &Path) -> Result<BTreeMap<String, FileHistorySummary>> {
    match fs::read(path) {
        Ok(raw) => Ok(serde_json::from_slice(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_dump(path: &Path, dump: &BTreeMap<String, FileHistorySummary>) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_vec_pretty(dump)?)?;
    Ok(())
}

fn commits_from_cache(value: &Value) -> Option<Vec<CommitEntry>> {
    serde_json::from_value(value.get("commits")?.clone()).ok()
}

/// Map one REST commit object into a cache entry.
fn commit_from_rest(commit: &Value) -> Option<CommitEntry> {
    let author = commit.get("commit")?.get("author").cloned().unwrap_or(Value::Null);
    Some(CommitEntry {
        sha: short_sha(commit.get("sha")?.as_str()?),
        author: author.get("name").and_then(Value::as_str).map(str::to_string),
        date: author.get("date").and_then(Value::as_str).map(str::to_string),
        message: first_line_truncated(
            commit
                .get("commit")
                .and_then(|c| c.get("message"))
                .and_then(Value::as_str)
                .unwrap_or(""),
        ),
    })
}

/// Map one GraphQL history node into a cache entry.
fn commit_from_graphql(node: &Value) -> Option<CommitEntry> {
    Some(CommitEntry {
        sha: short_sha(node.get("oid")?.as_str()?),
        author: node
            .get("author")
            .and_then(|a| a.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string),
        date: node
            .get("committedDate")
            .and_then(Value::as_str)
            .map(str::to_string),
        message: first_line_truncated(
            node.get("messageHeadline").and_then(Value::as_str).unwrap_or(""),
        ),
    })
}

/// Run the history pass for every file not yet in the dump at `output`.
pub async fn fetch_history(
    rest: &Arc<RestClient>,
    graphql: &Arc<GraphqlClient>,
    store: &Store,
    output: &Path,
    strategy: FetchStrategy,
) -> Result<PassStats> {
    let cache = rest.cache();
    let all_files = store.all_files().await?;
    let mut dump = load_dump(output)?;

    let pending: Vec<FileRecord> = all_files
        .iter()
        .filter(|f| !dump.contains_key(&f.url))
        .cloned()
        .collect();
    log::info!(
        target: LOG_TARGET,
        "Found {} files, {} need history",
        all_files.len(),
        pending.len()
    );

    let mut stats = PassStats {
        skipped: (all_files.len() - pending.len()) as u64,
        ..PassStats::default()
    };

    match strategy {
        FetchStrategy::Rest => {
            for record in &pending {
                let params = cache_params(&record.owner, &record.repo, &record.path);

                if let Some(cached) = cache.load_bare(CACHE_ENDPOINT, &params) {
                    if cached.get("error").is_some() {
                        stats.not_found += 1;
                    } else if let Some(commits) = commits_from_cache(&cached) {
                        let _ = dump.insert(record.url.clone(), summarize(&commits));
                        stats.fetched += 1;
                    } else {
                        stats.errors += 1;
                    }
                    continue;
                }

                let endpoint = format!("repos/{}/{}/commits", record.owner, record.repo);
                let query = vec![
                    ("path".to_string(), record.path.clone()),
                    ("per_page".to_string(), "100".to_string()),
                ];
                match rest.api_uncached(&endpoint, &query).await {
                    Ok(resp) => {
                        let commits: Vec<CommitEntry> = resp
                            .body
                            .as_array()
                            .map(|list| list.iter().filter_map(commit_from_rest).collect())
                            .unwrap_or_default();
                        cache.save_bare(
                            CACHE_ENDPOINT,
                            &params,
                            &json!({"commits": commits}),
                        );
                        let _ = dump.insert(record.url.clone(), summarize(&commits));
                        stats.fetched += 1;
                    }
                    Err(e) if e.status() == Some(404) => {
                        cache.save_bare(CACHE_ENDPOINT, &params, &json!({"error": "not_found"}));
                        stats.not_found += 1;
                    }
                    Err(e) => {
                        log::warn!(target: LOG_TARGET, "Could not fetch history for {}: {e:#}", record.url);
                        stats.errors += 1;
                    }
                }
            }
        }
        FetchStrategy::Graphql { batch_size } => {
            graphql_pass(graphql, cache, &pending, batch_size.max(1), &mut dump, &mut stats)
                .await?;
        }
    }

    write_dump(output, &dump)?;
    log::info!(
        target: LOG_TARGET,
        "Done: {} fetched, {} not found, {} errors",
        stats.fetched,
        stats.not_found,
        stats.errors
    );
    Ok(stats)
}

async fn graphql_pass(
    graphql: &GraphqlClient,
    cache: &ResponseCache,
    pending: &[FileRecord],
    batch_size: usize,
    dump: &mut BTreeMap<String, FileHistorySummary>,
    stats: &mut PassStats,
) -> Result<()> {
    let mut queue: VecDeque<Vec<FileRecord>> =
        pending.chunks(batch_size).map(<[FileRecord]>::to_vec).collect();

    while let Some(batch) = queue.pop_front() {
        let mut uncached = Vec::new();
        for record in batch {
            let params = cache_params(&record.owner, &record.repo, &record.path);
            match cache.load_bare(CACHE_ENDPOINT, &params) {
                Some(cached) if cached.get("error").is_some() => stats.not_found += 1,
                Some(cached) => match commits_from_cache(&cached) {
                    Some(commits) => {
                        let _ = dump.insert(record.url.clone(), summarize(&commits));
                        stats.fetched += 1;
                    }
                    None => uncached.push(record),
                },
                None => uncached.push(record),
            }
        }
        if uncached.is_empty() {
            continue;
        }

        let history_query = build_history_query(&uncached);
        let body = graphql.execute(&history_query.query, None).await?;
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
                stats.errors += 1;
            }
            continue;
        }

        let data = body.get("data").cloned().unwrap_or(Value::Null);
        for (i, record) in uncached.iter().enumerate() {
            let (repo_alias, ref_alias, file_alias) = &history_query.aliases[i];
            let params = cache_params(&record.owner, &record.repo, &record.path);

            let repo_node = data.get(repo_alias).filter(|n| !n.is_null());
            let Some(repo_node) = repo_node else {
                cache.save_bare(CACHE_ENDPOINT, &params, &json!({"error": "not_found"}));
                stats.not_found += 1;
                continue;
            };

            let ref_node = repo_node.get(ref_alias).filter(|n| !n.is_null());
            let Some(ref_node) = ref_node else {
                cache.save_bare(CACHE_ENDPOINT, &params, &json!({"error": "bad_ref"}));
                stats.not_found += 1;
                continue;
            };

            let history_node = ref_node.get(file_alias).filter(|n| !n.is_null());
            let Some(history_node) = history_node else {
                cache.save_bare(CACHE_ENDPOINT, &params, &json!({"error": "no_history"}));
                stats.not_found += 1;
                continue;
            };

            let commits: Vec<CommitEntry> = history_node
                .get("nodes")
                .and_then(Value::as_array)
                .map(|nodes| nodes.iter().filter_map(commit_from_graphql).collect())
                .unwrap_or_default();

            cache.save_bare(CACHE_ENDPOINT, &params, &json!({"commits": commits}));
            let _ = dump.insert(record.url.clone(), summarize(&commits));
            stats.fetched += 1;
        }
    }
    Ok(())
}
