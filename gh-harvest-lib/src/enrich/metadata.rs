//! Repository metadata pass.
//!
//! Produces one JSON object keyed `owner/repo`, merged with any existing
//! dump on disk so a restart only fetches repos that are not yet present.

use super::batch::{build_metadata_query, is_complexity_error};
use super::{FetchStrategy, PassStats};
use crate::client::{GraphqlClient, ResponseCache, RestClient};
use crate::Result;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;

const LOG_TARGET: &str = "  metadata";

const CACHE_ENDPOINT: &str = "repo_metadata";

/// Enrichment fields for one repository. Timestamps are kept as the
/// host's RFC 3339 strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoMetadata {
    pub stars: Option<u64>,
    pub forks: Option<u64>,
    pub watchers: Option<u64>,
    pub language: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub pushed_at: Option<String>,
    pub default_branch: Option<String>,
    pub license: Option<String>,
    pub description: Option<String>,
}

fn cache_params(repo_key: &str) -> Vec<(String, String)> {
    vec![("repo_key".to_string(), repo_key.to_string())]
}

/// Read an existing dump, tolerating a missing file.
pub fn load_dump(path: &Path) -> Result<BTreeMap<String, RepoMetadata>> {
    match fs::read(path) {
        Ok(raw) => Ok(serde_json::from_slice(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_dump(path: &Path, dump: &BTreeMap<String, RepoMetadata>) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_vec_pretty(dump)?)?;
    Ok(())
}

/// Map a REST `repos/{owner}/{repo}` body into metadata fields.
fn from_rest_body(body: &Value) -> RepoMetadata {
    RepoMetadata {
        stars: body.get("stargazers_count").and_then(Value::as_u64),
        forks: body.get("forks_count").and_then(Value::as_u64),
        watchers: body.get("watchers_count").and_then(Value::as_u64),
        language: string_field(body, "language"),
        topics: body
            .get("topics")
            .and_then(Value::as_array)
            .map(|t| t.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default(),
        created_at: string_field(body, "created_at"),
        updated_at: string_field(body, "updated_at"),
        pushed_at: string_field(body, "pushed_at"),
        default_branch: string_field(body, "default_branch"),
        license: body
            .get("license")
            .and_then(|l| l.get("spdx_id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        description: string_field(body, "description"),
    }
}

/// Map one aliased GraphQL `repository` selection into metadata fields.
fn from_graphql_node(node: &Value) -> RepoMetadata {
    RepoMetadata {
        stars: node.get("stargazerCount").and_then(Value::as_u64),
        forks: node.get("forkCount").and_then(Value::as_u64),
        watchers: node
            .get("watchers")
            .and_then(|w| w.get("totalCount"))
            .and_then(Value::as_u64),
        language: node
            .get("primaryLanguage")
            .and_then(|l| l.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string),
        topics: node
            .get("repositoryTopics")
            .and_then(|t| t.get("nodes"))
            .and_then(Value::as_array)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|n| n.get("topic")?.get("name")?.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        created_at: string_field(node, "createdAt"),
        updated_at: string_field(node, "updatedAt"),
        pushed_at: string_field(node, "pushedAt"),
        default_branch: node
            .get("defaultBranchRef")
            .and_then(|b| b.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string),
        license: node
            .get("licenseInfo")
            .and_then(|l| l.get("spdxId"))
            .and_then(Value::as_str)
            .map(str::to_string),
        description: string_field(node, "description"),
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Run the metadata pass for every repo not yet in the dump at `output`.
pub async fn fetch_metadata(
    rest: &Arc<RestClient>,
    graphql: &Arc<GraphqlClient>,
    store: &Store,
    output: &Path,
    strategy: FetchStrategy,
) -> Result<PassStats> {
    let cache = rest.cache();
    let all_repos = store.unique_repos().await?;
    let mut dump = load_dump(output)?;

    let pending: Vec<(String, String)> = all_repos
        .iter()
        .filter(|(owner, repo)| !dump.contains_key(&format!("{owner}/{repo}")))
        .cloned()
        .collect();
    log::info!(
        target: LOG_TARGET,
        "Found {} unique repos, {} need metadata",
        all_repos.len(),
        pending.len()
    );

    let mut stats = PassStats {
        skipped: (all_repos.len() - pending.len()) as u64,
        ..PassStats::default()
    };

    match strategy {
        FetchStrategy::Rest => {
            for (owner, repo) in &pending {
                let repo_key = format!("{owner}/{repo}");
                let params = cache_params(&repo_key);

                if let Some(cached) = cache.load_bare(CACHE_ENDPOINT, &params) {
                    if cached.get("error").is_some() {
                        stats.not_found += 1;
                    } else if let Ok(meta) = serde_json::from_value::<RepoMetadata>(cached) {
                        let _ = dump.insert(repo_key, meta);
                        stats.fetched += 1;
                    } else {
                        stats.errors += 1;
                    }
                    continue;
                }

                match rest.api_uncached(&format!("repos/{owner}/{repo}"), &[]).await {
                    Ok(resp) => {
                        let meta = from_rest_body(&resp.body);
                        cache.save_bare(
                            CACHE_ENDPOINT,
                            &params,
                            &serde_json::to_value(&meta)?,
                        );
                        let _ = dump.insert(repo_key, meta);
                        stats.fetched += 1;
                    }
                    Err(e) if e.status() == Some(404) => {
                        cache.save_bare(CACHE_ENDPOINT, &params, &json!({"error": "not_found"}));
                        stats.not_found += 1;
                    }
                    Err(e) => {
                        log::warn!(target: LOG_TARGET, "Could not fetch metadata for '{repo_key}': {e:#}");
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
    pending: &[(String, String)],
    batch_size: usize,
    dump: &mut BTreeMap<String, RepoMetadata>,
    stats: &mut PassStats,
) -> Result<()> {
    let mut queue: VecDeque<Vec<(String, String)>> =
        pending.chunks(batch_size).map(<[(String, String)]>::to_vec).collect();

    while let Some(batch) = queue.pop_front() {
        let mut uncached = Vec::new();
        for (owner, repo) in batch {
            let repo_key = format!("{owner}/{repo}");
            match cache.load_bare(CACHE_ENDPOINT, &cache_params(&repo_key)) {
                Some(cached) if cached.get("error").is_some() => stats.not_found += 1,
                Some(cached) => match serde_json::from_value::<RepoMetadata>(cached) {
                    Ok(meta) => {
                        let _ = dump.insert(repo_key, meta);
                        stats.fetched += 1;
                    }
                    Err(_) => stats.errors += 1,
                },
                None => uncached.push((owner, repo)),
            }
        }
        if uncached.is_empty() {
            continue;
        }

        let query = build_metadata_query(&uncached);
        let body = graphql.execute(&query, None).await?;
        stats.queries += 1;

        if is_complexity_error(&body) {
            if uncached.len() > 1 {
                let mid = uncached.len() / 2;
                let back = uncached.split_off(mid);
                queue.push_front(back);
                queue.push_front(uncached);
            } else {
                stats.errors += 1;
            }
            continue;
        }

        let data = body.get("data").cloned().unwrap_or(Value::Null);
        for (i, (owner, repo)) in uncached.iter().enumerate() {
            let repo_key = format!("{owner}/{repo}");
            let params = cache_params(&repo_key);
            let alias = format!("r{i}");
            let node = data.get(alias.as_str()).filter(|n| !n.is_null());

            match node {
                Some(node) => {
                    let meta = from_graphql_node(node);
                    cache.save_bare(CACHE_ENDPOINT, &params, &serde_json::to_value(&meta)?);
                    let _ = dump.insert(repo_key, meta);
                    stats.fetched += 1;
                }
                None => {
                    cache.save_bare(CACHE_ENDPOINT, &params, &json!({"error": "not_found"}));
                    stats.not_found += 1;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileRecord;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_RPS: f64 = 10_000.0;

    fn record(owner: &str, repo: &str) -> FileRecord {
        FileRecord {
            owner: owner.to_string(),
            repo: repo.to_string(),
            git_ref: "main".to_string(),
            path: "x.md".to_string(),
            sha: "s".to_string(),
            size: None,
            url: format!("https://github.com/{owner}/{repo}/blob/main/x.md"),
        }
    }

    async fn fixture(
        server: &MockServer,
        dir: &Path,
    ) -> (Arc<RestClient>, Arc<GraphqlClient>, Store) {
        let cache = Arc::new(ResponseCache::open(dir.join("cache"), false).unwrap());
        (
            Arc::new(RestClient::new("t", server.uri(), Arc::clone(&cache), TEST_RPS).unwrap()),
            Arc::new(GraphqlClient::new("t", server.uri(), cache, TEST_RPS).unwrap()),
            Store::open(&dir.join("files.db")).await.unwrap(),
        )
    }

    #[tokio::test]
    async fn rest_pass_builds_the_dump() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/a/b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "stargazers_count": 42,
                "forks_count": 7,
                "watchers_count": 42,
                "language": "Rust",
                "topics": ["cli", "search"],
                "created_at": "2020-01-01T00:00:00Z",
                "updated_at": "2024-06-01T00:00:00Z",
                "pushed_at": "2024-06-02T00:00:00Z",
                "default_branch": "main",
                "license": {"spdx_id": "MIT"},
                "description": "a tool"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let (rest, graphql, store) = fixture(&server, tmp.path()).await;
        let _ = store.insert_files(&[record("a", "b")]).await.unwrap();
        let output = tmp.path().join("repo_metadata.json");

        let stats = fetch_metadata(&rest, &graphql, &store, &output, FetchStrategy::Rest)
            .await
            .unwrap();
        assert_eq!(stats.fetched, 1);

        let dump = load_dump(&output).unwrap();
        let meta = &dump["a/b"];
        assert_eq!(meta.stars, Some(42));
        assert_eq!(meta.language.as_deref(), Some("Rust"));
        assert_eq!(meta.topics, vec!["cli", "search"]);
        assert_eq!(meta.license.as_deref(), Some("MIT"));
    }

    #[tokio::test]
    async fn repos_already_in_dump_are_not_refetched() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let (rest, graphql, store) = fixture(&server, tmp.path()).await;
        let _ = store.insert_files(&[record("a", "b")]).await.unwrap();

        let output = tmp.path().join("repo_metadata.json");
        let mut dump = BTreeMap::new();
        let _ = dump.insert("a/b".to_string(), RepoMetadata { stars: Some(1), ..Default::default() });
        write_dump(&output, &dump).unwrap();

        // No mocks: a request would fail the pass.
        let stats = fetch_metadata(&rest, &graphql, &store, &output, FetchStrategy::Rest)
            .await
            .unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.fetched, 0);

        // The preexisting entry survived the rewrite.
        assert_eq!(load_dump(&output).unwrap()["a/b"].stars, Some(1));
    }

    #[tokio::test]
    async fn missing_repo_is_cached_negatively() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let (rest, graphql, store) = fixture(&server, tmp.path()).await;
        let _ = store.insert_files(&[record("a", "gone")]).await.unwrap();
        let output = tmp.path().join("repo_metadata.json");

        let stats = fetch_metadata(&rest, &graphql, &store, &output, FetchStrategy::Rest)
            .await
            .unwrap();
        assert_eq!(stats.not_found, 1);

        // Re-running consults the negative cache entry, not the host.
        let stats = fetch_metadata(&rest, &graphql, &store, &output, FetchStrategy::Rest)
            .await
            .unwrap();
        assert_eq!(stats.not_found, 1);
    }

    #[tokio::test]
    async fn graphql_pass_maps_fields_and_nulls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "r0": {
                        "stargazerCount": 10,
                        "forkCount": 2,
                        "watchers": {"totalCount": 3},
                        "primaryLanguage": {"name": "Rust"},
                        "repositoryTopics": {"nodes": [{"topic": {"name": "cli"}}]},
                        "createdAt": "2021-01-01T00:00:00Z",
                        "updatedAt": "2024-01-01T00:00:00Z",
                        "pushedAt": "2024-01-02T00:00:00Z",
                        "defaultBranchRef": {"name": "main"},
                        "licenseInfo": {"spdxId": "Apache-2.0"},
                        "description": "desc"
                    },
                    "r1": null
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let (rest, graphql, store) = fixture(&server, tmp.path()).await;
        let _ = store
            .insert_files(&[record("a", "b"), record("c", "gone")])
            .await
            .unwrap();
        let output = tmp.path().join("repo_metadata.json");

        let stats = fetch_metadata(
            &rest,
            &graphql,
            &store,
            &output,
            FetchStrategy::Graphql { batch_size: 50 },
        )
        .await
        .unwrap();

        assert_eq!(stats.fetched, 1);
        assert_eq!(stats.not_found, 1);

        let dump = load_dump(&output).unwrap();
        let meta = &dump["a/b"];
        assert_eq!(meta.stars, Some(10));
        assert_eq!(meta.watchers, Some(3));
        assert_eq!(meta.default_branch.as_deref(), Some("main"));
        assert_eq!(meta.license.as_deref(), Some("Apache-2.0"));
        assert!(!dump.contains_key("c/gone"));
    }

    #[test]
    fn rest_body_with_missing_fields_maps_to_none() {
        let meta = from_rest_body(&json!({"stargazers_count": 5}));
        assert_eq!(meta.stars, Some(5));
        assert!(meta.language.is_none());
        assert!(meta.topics.is_empty());
        assert!(meta.license.is_none());
    }
}
