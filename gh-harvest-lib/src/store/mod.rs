//! Durable SQLite record of discovered files and collection progress.
//!
//! The store is opened with WAL journaling and a create-if-absent schema,
//! so it is safe to terminate the process at any point: any row visible
//! on read is committed. Duplicate file inserts are absorbed by the
//! unique key, which lets the collector replay chunks without tracking
//! what it has already persisted.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

const LOG_TARGET: &str = "     store";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    owner TEXT NOT NULL,
    repo TEXT NOT NULL,
    ref TEXT NOT NULL,
    path TEXT NOT NULL,
    sha TEXT NOT NULL,
    size INTEGER,
    url TEXT NOT NULL,
    discovered_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(owner, repo, ref, path)
);

CREATE TABLE IF NOT EXISTS content_status (
    url TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    fetched_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS search_hits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    query TEXT NOT NULL,
    size_lo INTEGER,
    size_hi INTEGER,
    hit_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_search_hits_url ON search_hits(url);

CREATE TABLE IF NOT EXISTS scan_progress (
    query TEXT PRIMARY KEY,
    cursor_lo INTEGER NOT NULL DEFAULT 0,
    width INTEGER NOT NULL,
    max_size INTEGER NOT NULL,
    collected INTEGER NOT NULL DEFAULT 0,
    completed_at TEXT,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// One discovered file, uniquely identified by (owner, repo, ref, path).
///
/// Created exactly once by the path collector and never mutated after;
/// the byte size is unknown when the search API does not report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub owner: String,
    pub repo: String,
    pub git_ref: String,
    pub path: String,
    pub sha: String,
    pub size: Option<i64>,
    pub url: String,
}

/// One search row observed during a scan, kept for overlap analysis.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub url: String,
    pub query: String,
    pub size_lo: i64,
    pub size_hi: i64,
}

/// Persisted scan cursor for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanProgress {
    pub cursor_lo: u64,
    pub width: u64,
    pub max_size: u64,
    pub collected: u64,
    pub completed: bool,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the store at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            let _ = sqlx::query(statement).execute(&pool).await?;
        }

        log::debug!(target: LOG_TARGET, "Opened store at '{}'", path.display());
        Ok(Self { pool })
    }

    /// Insert files, silently absorbing duplicates. Returns the number of
    /// genuinely new rows.
    pub async fn insert_files(&self, files: &[FileRecord]) -> Result<u64> {
        let mut new_count = 0u64;
        if files.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for f in files {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO files (owner, repo, ref, path, sha, size, url) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&f.owner)
            .bind(&f.repo)
            .bind(&f.git_ref)
            .bind(&f.path)
            .bind(&f.sha)
            .bind(f.size)
            .bind(&f.url)
            .execute(&mut *tx)
            .await?;
            new_count += result.rows_affected();
        }
        tx.commit().await?;

        Ok(new_count)
    }

    /// Record search rows for later overlap analysis.
    pub async fn insert_search_hits(&self, hits: &[SearchHit]) -> Result<()> {
        if hits.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for h in hits {
            let _ = sqlx::query(
                "INSERT INTO search_hits (url, query, size_lo, size_hi) VALUES (?, ?, ?, ?)",
            )
            .bind(&h.url)
            .bind(&h.query)
            .bind(h.size_lo)
            .bind(h.size_hi)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn file_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.unsigned_abs())
    }

    pub async fn all_files(&self) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            "SELECT owner, repo, ref, path, sha, size, url FROM files ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(file_from_row).collect())
    }

    /// Files that have no recorded content status yet.
    pub async fn files_without_content(&self) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            "SELECT f.owner, f.repo, f.ref, f.path, f.sha, f.size, f.url \
             FROM files f LEFT JOIN content_status c ON f.url = c.url \
             WHERE c.url IS NULL ORDER BY f.rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(file_from_row).collect())
    }

    /// Distinct (owner, repo) pairs across all discovered files.
    pub async fn unique_repos(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT DISTINCT owner, repo FROM files ORDER BY owner, repo")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("owner"), row.get("repo")))
            .collect())
    }

    /// Record per-file content outcomes in a single transaction.
    pub async fn record_content_status(&self, items: &[(String, String)]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (url, status) in items {
            let _ = sqlx::query(
                "INSERT OR REPLACE INTO content_status (url, status) VALUES (?, ?)",
            )
            .bind(url)
            .bind(status)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn scan_progress(&self, query: &str) -> Result<Option<ScanProgress>> {
        let row = sqlx::query(
            "SELECT cursor_lo, width, max_size, collected, completed_at \
             FROM scan_progress WHERE query = ?",
        )
        .bind(query)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ScanProgress {
            cursor_lo: row.get::<i64, _>("cursor_lo").unsigned_abs(),
            width: row.get::<i64, _>("width").unsigned_abs(),
            max_size: row.get::<i64, _>("max_size").unsigned_abs(),
            collected: row.get::<i64, _>("collected").unsigned_abs(),
            completed: row.get::<Option<String>, _>("completed_at").is_some(),
        }))
    }

    /// Persist the scan cursor. Must be called after each processed chunk
    /// so a restart never reopens a completed range.
    pub async fn update_scan_progress(
        &self,
        query: &str,
        progress: &ScanProgress,
    ) -> Result<()> {
        let _ = sqlx::query(
            "INSERT OR REPLACE INTO scan_progress \
             (query, cursor_lo, width, max_size, collected, completed_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, \
                     CASE WHEN ? THEN datetime('now') ELSE NULL END, datetime('now'))",
        )
        .bind(query)
        .bind(i64::try_from(progress.cursor_lo).unwrap_or(i64::MAX))
        .bind(i64::try_from(progress.width).unwrap_or(i64::MAX))
        .bind(i64::try_from(progress.max_size).unwrap_or(i64::MAX))
        .bind(i64::try_from(progress.collected).unwrap_or(i64::MAX))
        .bind(progress.completed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// URLs that turned up in more than one size range during scanning.
    pub async fn multi_range_hits(&self) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query(
            "SELECT url, COUNT(DISTINCT size_lo || '-' || size_hi) AS range_count \
             FROM search_hits GROUP BY url HAVING range_count > 1 \
             ORDER BY range_count DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("url"), row.get::<i64, _>("range_count").unsigned_abs()))
            .collect())
    }
}

fn file_from_row(row: &sqlx::sqlite::SqliteRow) -> FileRecord {
    FileRecord {
        owner: row.get("owner"),
        repo: row.get("repo"),
        git_ref: row.get("ref"),
        path: row.get("path"),
        sha: row.get("sha"),
        size: row.get("size"),
        url: row.get("url"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner: &str, repo: &str, path: &str) -> FileRecord {
        FileRecord {
            owner: owner.to_string(),
            repo: repo.to_string(),
            git_ref: "main".to_string(),
            path: path.to_string(),
            sha: "abc123".to_string(),
            size: Some(42),
            url: format!("https://github.com/{owner}/{repo}/blob/main/{path}"),
        }
    }

    async fn open_store(dir: &Path) -> Store {
        Store::open(&dir.join("files.db")).await.unwrap()
    }

    #[tokio::test]
    async fn insert_and_count() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path()).await;

        let new = store
            .insert_files(&[record("a", "b", "x.md"), record("a", "b", "y.md")])
            .await
            .unwrap();
        assert_eq!(new, 2);
        assert_eq!(store.file_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicate_inserts_are_absorbed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path()).await;

        let first = store.insert_files(&[record("a", "b", "x.md")]).await.unwrap();
        let second = store.insert_files(&[record("a", "b", "x.md")]).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(store.file_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn same_path_different_repo_is_distinct() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path()).await;

        let new = store
            .insert_files(&[record("a", "b", "x.md"), record("a", "c", "x.md")])
            .await
            .unwrap();
        assert_eq!(new, 2);
    }

    #[tokio::test]
    async fn files_without_content_shrinks_as_statuses_land() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path()).await;

        let r1 = record("a", "b", "x.md");
        let r2 = record("a", "b", "y.md");
        let _ = store.insert_files(&[r1.clone(), r2.clone()]).await.unwrap();

        assert_eq!(store.files_without_content().await.unwrap().len(), 2);

        store
            .record_content_status(&[(r1.url.clone(), "fetched".to_string())])
            .await
            .unwrap();

        let pending = store.files_without_content().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].url, r2.url);
    }

    #[tokio::test]
    async fn unique_repos_deduplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path()).await;

        let _ = store
            .insert_files(&[
                record("a", "b", "x.md"),
                record("a", "b", "y.md"),
                record("c", "d", "x.md"),
            ])
            .await
            .unwrap();

        let repos = store.unique_repos().await.unwrap();
        assert_eq!(
            repos,
            vec![
                ("a".to_string(), "b".to_string()),
                ("c".to_string(), "d".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn scan_progress_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path()).await;

        assert!(store.scan_progress("q").await.unwrap().is_none());

        let progress = ScanProgress {
            cursor_lo: 5000,
            width: 200,
            max_size: 1_000_000,
            collected: 123,
            completed: false,
        };
        store.update_scan_progress("q", &progress).await.unwrap();
        assert_eq!(store.scan_progress("q").await.unwrap().unwrap(), progress);

        let done = ScanProgress { completed: true, ..progress };
        store.update_scan_progress("q", &done).await.unwrap();
        assert!(store.scan_progress("q").await.unwrap().unwrap().completed);
    }

    #[tokio::test]
    async fn multi_range_hits_reports_overlaps() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path()).await;

        let hit = |lo: i64, hi: i64| SearchHit {
            url: "https://github.com/a/b/blob/main/x.md".to_string(),
            query: "q".to_string(),
            size_lo: lo,
            size_hi: hi,
        };
        store
            .insert_search_hits(&[hit(0, 100), hit(100, 200), hit(0, 100)])
            .await
            .unwrap();

        let overlaps = store.multi_range_hits().await.unwrap();
        assert_eq!(overlaps.len(), 1);
        assert_eq!(overlaps[0].1, 2);
    }

    #[tokio::test]
    async fn reopening_preserves_rows() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = open_store(tmp.path()).await;
            let _ = store.insert_files(&[record("a", "b", "x.md")]).await.unwrap();
        }
        let store = open_store(tmp.path()).await;
        assert_eq!(store.file_count().await.unwrap(), 1);
    }
}
