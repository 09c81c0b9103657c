//! Size-sharded path collector.
//!
//! The code-search API returns at most 1,000 results per query, and its
//! index silently drops matches from wide size ranges even below that
//! cap. The collector therefore walks the byte-size axis linearly with
//! an adaptively sized chunk, narrowing on saturation and widening
//! through sparse regions, until the union of processed chunks covers
//! `[0, max_size)` with no gaps and no overlaps.

pub mod search;

use crate::ghurl;
use crate::store::{FileRecord, ScanProgress, SearchHit, Store};
use crate::Result;
use search::{SearchApi, SearchItem};

const LOG_TARGET: &str = "      scan";

/// The host's hard cap on results per query.
pub const SEARCH_RESULT_LIMIT: u64 = 1000;

/// Below this count a chunk is sparse enough to widen afterwards.
const LOW_WATERMARK: u64 = 50;

/// Rows per page and the host's page window (10 * 100 = the result cap).
const PAGE_SIZE: u32 = 100;
const MAX_PAGES: u32 = 10;

/// Retries for a page that comes back empty while rows are still owed.
const MAX_EMPTY_RETRIES: u32 = 3;

/// Tunable bounds for one scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanConfig {
    /// Exclusive upper bound of the size axis.
    pub max_size: u64,
    /// Starting chunk width.
    pub initial_width: u64,
    /// Cap on chunk widening.
    pub max_width: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000_000,
            initial_width: 100,
            max_width: 100_000,
        }
    }
}

/// A half-open byte-size interval `[lo, hi)` and the count the host
/// reported for the unpaginated query over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchChunk {
    pub lo: u64,
    pub hi: u64,
    pub count: u64,
}

/// What to do after a chunk has been examined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Chunk is oversubscribed: halve the width, stay put.
    Narrow { width: u64 },
    /// Oversubscribed at the minimum width; the size axis is exhausted.
    Fatal { size: u64, count: u64 },
    /// Chunk handled: move the cursor, possibly widen.
    Advance { lo: u64, width: u64 },
}

/// Decide the next scan step for a processed chunk.
///
/// `rows` is the number of rows actually paged out of the chunk, which
/// catches the case where the reported count was under the cap but the
/// row stream still hit it.
fn adapt(chunk: SearchChunk, rows: u64, width: u64, config: &ScanConfig) -> Step {
    if chunk.count >= SEARCH_RESULT_LIMIT || rows >= SEARCH_RESULT_LIMIT {
        if chunk.hi - chunk.lo <= 1 {
            return Step::Fatal {
                size: chunk.lo,
                count: chunk.count.max(rows),
            };
        }
        return Step::Narrow {
            width: (width / 2).max(1),
        };
    }

    let next_width = if chunk.count <= LOW_WATERMARK {
        (width * 2).min(config.max_width)
    } else {
        width
    };
    Step::Advance {
        lo: chunk.hi,
        width: next_width,
    }
}

/// Outcome of a completed scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanSummary {
    /// The host's reported total for the unsharded query.
    pub total_reported: u64,
    /// Rows in the store attributable to this query after the scan.
    pub collected: u64,
    /// Chunks processed this run.
    pub chunks: u64,
}

/// Drives the search API to enumerate every file matching a query.
#[derive(Debug)]
pub struct Scanner {
    search: SearchApi,
    config: ScanConfig,
}

impl Scanner {
    pub fn new(search: SearchApi, config: ScanConfig) -> Self {
        Self { search, config }
    }

    /// Run the scan to completion, resuming from any persisted cursor.
    ///
    /// The cursor is persisted after every chunk, strictly before the
    /// next chunk is issued, so interrupting at any point leaves no gap.
    pub async fn run(&self, store: &Store, query: &str, skip_cache: bool) -> Result<ScanSummary> {
        let prior = store.scan_progress(query).await?;
        if !skip_cache {
            if let Some(p) = &prior {
                if p.completed {
                    log::info!(
                        target: LOG_TARGET,
                        "Scan already completed ({} files); use --skip-cache to rescan",
                        p.collected
                    );
                    return Ok(ScanSummary {
                        total_reported: 0,
                        collected: p.collected,
                        chunks: 0,
                    });
                }
            }
        }

        let total_reported = self.search.total_count(query).await?;
        log::info!(target: LOG_TARGET, "Total reported for '{query}': {total_reported}");

        let mut collected = store.file_count().await?;
        if collected > 0 {
            log::info!(target: LOG_TARGET, "Resuming with {collected} files already collected");
        }

        let (mut lo, mut width) = match prior {
            Some(p) if !skip_cache && p.cursor_lo > 0 => {
                log::info!(target: LOG_TARGET, "Resuming scan from size {}", p.cursor_lo);
                (p.cursor_lo, p.width.max(1))
            }
            _ => (0, self.config.initial_width),
        };

        let mut chunks = 0u64;
        while lo < self.config.max_size {
            let hi = (lo + width).min(self.config.max_size);
            let chunk_query = format!("{query} size:{lo}..{}", hi - 1);

            let count = self.search.total_count(&chunk_query).await?;
            let chunk = SearchChunk { lo, hi, count };
            chunks += 1;

            let rows = if count == 0 || count >= SEARCH_RESULT_LIMIT {
                0
            } else {
                self.collect_chunk(store, &chunk_query, &chunk, &mut collected)
                    .await?
            };

            match adapt(chunk, rows, width, &self.config) {
                Step::Fatal { size, count } => {
                    return Err(crate::Error::IrreducibleSaturation { size, count });
                }
                Step::Narrow { width: w } => {
                    log::info!(
                        target: LOG_TARGET,
                        "size {lo}..{} = {count} rows, narrowing to width {w}",
                        hi - 1
                    );
                    width = w;
                }
                Step::Advance { lo: new_lo, width: w } => {
                    log::info!(
                        target: LOG_TARGET,
                        "size {lo}..{} = {count} rows ({collected} collected)",
                        hi - 1
                    );
                    lo = new_lo;
                    width = w;
                }
            }

            store
                .update_scan_progress(
                    query,
                    &ScanProgress {
                        cursor_lo: lo,
                        width,
                        max_size: self.config.max_size,
                        collected,
                        completed: false,
                    },
                )
                .await?;
        }

        store
            .update_scan_progress(
                query,
                &ScanProgress {
                    cursor_lo: lo,
                    width,
                    max_size: self.config.max_size,
                    collected,
                    completed: true,
                },
            )
            .await?;

        log::info!(target: LOG_TARGET, "Done: collected {collected} / {total_reported} reported");
        Ok(ScanSummary {
            total_reported,
            collected,
            chunks,
        })
    }

    /// Page every row out of one chunk, inserting each page before the
    /// next is fetched so an interruption loses nothing.
    async fn collect_chunk(
        &self,
        store: &Store,
        chunk_query: &str,
        chunk: &SearchChunk,
        collected: &mut u64,
    ) -> Result<u64> {
        let mut rows = 0u64;
        let mut page_no = 1u32;
        let mut empty_retries = 0u32;
        let mut expected_total: Option<u64> = None;

        while page_no <= MAX_PAGES {
            let page = self.search.page(chunk_query, PAGE_SIZE, page_no).await?;
            let total = *expected_total.get_or_insert(page.total_count);

            if page.items.is_empty() {
                let expected_so_far = total.min(u64::from(page_no) * u64::from(PAGE_SIZE));
                if rows >= expected_so_far || rows >= total {
                    break;
                }
                empty_retries += 1;
                if empty_retries >= MAX_EMPTY_RETRIES {
                    log::warn!(
                        target: LOG_TARGET,
                        "Gave up on '{chunk_query}' page {page_no} after {empty_retries} empty responses ({rows}/{total} rows)"
                    );
                    break;
                }
                continue;
            }
            empty_retries = 0;

            let records: Vec<FileRecord> = page.items.iter().filter_map(file_from_item).collect();
            if records.len() < page.items.len() {
                log::warn!(
                    target: LOG_TARGET,
                    "Dropped {} rows with unparseable URLs",
                    page.items.len() - records.len()
                );
            }

            let hits: Vec<SearchHit> = records
                .iter()
                .map(|r| SearchHit {
                    url: r.url.clone(),
                    query: chunk_query.to_string(),
                    size_lo: i64::try_from(chunk.lo).unwrap_or(i64::MAX),
                    size_hi: i64::try_from(chunk.hi).unwrap_or(i64::MAX),
                })
                .collect();
            store.insert_search_hits(&hits).await?;
            *collected += store.insert_files(&records).await?;

            rows += page.items.len() as u64;
            if rows >= SEARCH_RESULT_LIMIT || rows >= total {
                break;
            }
            page_no += 1;
        }

        Ok(rows)
    }
}

/// Build a file record from one search row. The repository's full name is
/// authoritative for owner/repo; the ref only exists inside the blob URL.
fn file_from_item(item: &SearchItem) -> Option<FileRecord> {
    let blob = ghurl::parse_blob_url(&item.html_url)?;
    let (owner, repo) = item.repo_full_name.split_once('/')?;
    Some(FileRecord {
        owner: owner.to_string(),
        repo: repo.to_string(),
        git_ref: blob.git_ref,
        path: item.path.clone(),
        sha: item.sha.clone(),
        size: None,
        url: item.html_url.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ResponseCache, RestClient};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> ScanConfig {
        ScanConfig {
            max_size: 200,
            initial_width: 100,
            max_width: 1000,
        }
    }

    // -- adapt --

    #[test]
    fn count_under_cap_advances() {
        let step = adapt(SearchChunk { lo: 0, hi: 100, count: 999 }, 999, 100, &config());
        assert_eq!(step, Step::Advance { lo: 100, width: 100 });
    }

    #[test]
    fn count_at_cap_narrows_without_advancing() {
        let step = adapt(SearchChunk { lo: 0, hi: 100, count: 1000 }, 0, 100, &config());
        assert_eq!(step, Step::Narrow { width: 50 });
    }

    #[test]
    fn sparse_chunk_widens_capped() {
        let step = adapt(SearchChunk { lo: 0, hi: 100, count: 50 }, 50, 100, &config());
        assert_eq!(step, Step::Advance { lo: 100, width: 200 });

        let step = adapt(SearchChunk { lo: 0, hi: 800, count: 0 }, 0, 800, &config());
        assert_eq!(step, Step::Advance { lo: 800, width: 1000 });
    }

    #[test]
    fn comfortable_chunk_keeps_width() {
        let step = adapt(SearchChunk { lo: 0, hi: 100, count: 51 }, 51, 100, &config());
        assert_eq!(step, Step::Advance { lo: 100, width: 100 });

        let step = adapt(SearchChunk { lo: 0, hi: 100, count: 500 }, 500, 100, &config());
        assert_eq!(step, Step::Advance { lo: 100, width: 100 });
    }

    #[test]
    fn width_floor_is_one_byte() {
        let step = adapt(SearchChunk { lo: 7, hi: 9, count: 1200 }, 0, 2, &config());
        assert_eq!(step, Step::Narrow { width: 1 });
    }

    #[test]
    fn saturation_at_width_one_is_fatal() {
        let step = adapt(SearchChunk { lo: 712, hi: 713, count: 1500 }, 0, 1, &config());
        assert_eq!(step, Step::Fatal { size: 712, count: 1500 });
    }

    #[test]
    fn row_ceiling_counts_as_saturation() {
        // Reported count lied low but the row stream hit the cap.
        let step = adapt(SearchChunk { lo: 0, hi: 100, count: 800 }, 1000, 100, &config());
        assert_eq!(step, Step::Narrow { width: 50 });
    }

    // -- full scans against a mock host --

    fn item(owner: &str, repo: &str, file: &str) -> Value {
        json!({
            "sha": format!("sha-{owner}-{repo}-{file}"),
            "path": file,
            "html_url": format!("https://github.com/{owner}/{repo}/blob/main/{file}"),
            "repository": {"full_name": format!("{owner}/{repo}")}
        })
    }

    async fn mount_search(server: &MockServer, q: &str, per_page: &str, total: u64, items: Vec<Value>) {
        Mock::given(method("GET"))
            .and(path("/search/code"))
            .and(query_param("q", q))
            .and(query_param("per_page", per_page))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"total_count": total, "items": items})),
            )
            .mount(server)
            .await;
    }

    async fn scanner_for(server: &MockServer, dir: &std::path::Path) -> (Scanner, Store) {
        let cache = Arc::new(ResponseCache::open(dir.join("cache"), false).unwrap());
        let rest = Arc::new(RestClient::new("t", server.uri(), cache, 10_000.0).unwrap());
        let scanner = Scanner::new(SearchApi::new(rest), config());
        let store = Store::open(&dir.join("files.db")).await.unwrap();
        (scanner, store)
    }

    #[tokio::test]
    async fn zero_match_query_completes_cleanly() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/code"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"total_count": 0, "items": []})),
            )
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let (scanner, store) = scanner_for(&server, tmp.path()).await;

        let summary = scanner.run(&store, "q", false).await.unwrap();
        assert_eq!(summary.collected, 0);
        assert_eq!(store.file_count().await.unwrap(), 0);

        let progress = store.scan_progress("q").await.unwrap().unwrap();
        assert!(progress.completed);
        assert_eq!(progress.cursor_lo, 200);
    }

    #[tokio::test]
    async fn saturated_chunk_is_split_until_exhaustible() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();

        // Overall total.
        mount_search(&server, "q", "1", 4, vec![item("a", "b", "x.md")]).await;
        // [0,100) saturated.
        mount_search(&server, "q size:0..99", "1", 1000, vec![]).await;
        // [0,50): 2 rows.
        mount_search(&server, "q size:0..49", "1", 2, vec![item("a", "b", "x.md")]).await;
        mount_search(
            &server,
            "q size:0..49",
            "100",
            2,
            vec![item("a", "b", "x.md"), item("a", "b", "y.md")],
        )
        .await;
        // [50,150): 2 rows, one overlapping the previous chunk.
        mount_search(&server, "q size:50..149", "1", 2, vec![item("a", "b", "x.md")]).await;
        mount_search(
            &server,
            "q size:50..149",
            "100",
            2,
            vec![item("a", "b", "x.md"), item("c", "d", "z.md")],
        )
        .await;
        // [150,200): empty.
        mount_search(&server, "q size:150..199", "1", 0, vec![]).await;

        let (scanner, store) = scanner_for(&server, tmp.path()).await;
        let summary = scanner.run(&store, "q", false).await.unwrap();

        // x.md appeared in two chunks; the unique key absorbed the replay.
        assert_eq!(store.file_count().await.unwrap(), 3);
        assert_eq!(summary.collected, 3);
        assert!(store.scan_progress("q").await.unwrap().unwrap().completed);

        // The overlapping URL is visible in the hit log.
        let overlaps = store.multi_range_hits().await.unwrap();
        assert_eq!(overlaps.len(), 1);
    }

    #[tokio::test]
    async fn irreducible_saturation_is_fatal_and_names_the_size() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();

        mount_search(&server, "q", "1", 5000, vec![]).await;
        mount_search(&server, "q size:0..0", "1", 1500, vec![]).await;

        let cache = Arc::new(ResponseCache::open(tmp.path().join("cache"), false).unwrap());
        let rest = Arc::new(RestClient::new("t", server.uri(), cache, 10_000.0).unwrap());
        let scanner = Scanner::new(
            SearchApi::new(rest),
            ScanConfig { max_size: 200, initial_width: 1, max_width: 1000 },
        );
        let store = Store::open(&tmp.path().join("files.db")).await.unwrap();

        let err = scanner.run(&store, "q", false).await.unwrap_err();
        match err {
            crate::Error::IrreducibleSaturation { size, count } => {
                assert_eq!(size, 0);
                assert_eq!(count, 1500);
            }
            other => panic!("expected IrreducibleSaturation, got {other}"),
        }
        // The saturated chunk was never marked processed.
        assert!(store.scan_progress("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completed_scan_short_circuits() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let (scanner, store) = scanner_for(&server, tmp.path()).await;

        store
            .update_scan_progress(
                "q",
                &ScanProgress {
                    cursor_lo: 200,
                    width: 100,
                    max_size: 200,
                    collected: 7,
                    completed: true,
                },
            )
            .await
            .unwrap();

        // No mocks mounted: any request would error out.
        let summary = scanner.run(&store, "q", false).await.unwrap();
        assert_eq!(summary.collected, 7);
        assert_eq!(summary.chunks, 0);
    }

    #[tokio::test]
    async fn scan_resumes_from_persisted_cursor() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let (scanner, store) = scanner_for(&server, tmp.path()).await;

        store
            .update_scan_progress(
                "q",
                &ScanProgress {
                    cursor_lo: 150,
                    width: 50,
                    max_size: 200,
                    collected: 0,
                    completed: false,
                },
            )
            .await
            .unwrap();

        mount_search(&server, "q", "1", 1, vec![]).await;
        // Only the remaining range is queried.
        mount_search(&server, "q size:150..199", "1", 1, vec![item("a", "b", "x.md")]).await;
        mount_search(&server, "q size:150..199", "100", 1, vec![item("a", "b", "x.md")]).await;

        let summary = scanner.run(&store, "q", false).await.unwrap();
        assert_eq!(summary.chunks, 1);
        assert_eq!(store.file_count().await.unwrap(), 1);
        assert!(store.scan_progress("q").await.unwrap().unwrap().completed);
    }

    #[tokio::test]
    async fn rerun_after_completion_inserts_nothing_new() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();

        mount_search(&server, "q", "1", 1, vec![item("a", "b", "x.md")]).await;
        mount_search(&server, "q size:0..99", "1", 1, vec![item("a", "b", "x.md")]).await;
        mount_search(&server, "q size:0..99", "100", 1, vec![item("a", "b", "x.md")]).await;
        mount_search(&server, "q size:100..199", "1", 0, vec![]).await;

        let (scanner, store) = scanner_for(&server, tmp.path()).await;

        let first = scanner.run(&store, "q", false).await.unwrap();
        assert_eq!(first.collected, 1);

        let second = scanner.run(&store, "q", false).await.unwrap();
        assert_eq!(second.collected, 1);
        assert_eq!(store.file_count().await.unwrap(), 1);
    }

    #[test]
    fn file_from_item_parses_ref_and_splits_full_name() {
        let raw = SearchItem {
            sha: "s".to_string(),
            path: "docs/x.md".to_string(),
            html_url: "https://github.com/a/b/blob/dev/docs/x.md".to_string(),
            repo_full_name: "a/b".to_string(),
        };
        let record = file_from_item(&raw).unwrap();
        assert_eq!(record.owner, "a");
        assert_eq!(record.repo, "b");
        assert_eq!(record.git_ref, "dev");
        assert_eq!(record.path, "docs/x.md");
        assert!(record.size.is_none());
    }

    #[test]
    fn unparseable_url_is_dropped() {
        let raw = SearchItem {
            sha: "s".to_string(),
            path: "x.md".to_string(),
            html_url: "https://gitlab.com/a/b/blob/main/x.md".to_string(),
            repo_full_name: "a/b".to_string(),
        };
        assert!(file_from_item(&raw).is_none());
    }
}
