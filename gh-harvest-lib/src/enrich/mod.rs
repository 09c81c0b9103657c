//! Batched enrichment fetchers.
//!
//! Three passes sweep the result store, each with a per-item REST
//! strategy and a batched GraphQL strategy. Both strategies share the
//! same bare-schema cache entries, so work done under one is never
//! repeated under the other.

pub mod batch;
pub mod content;
pub mod history;
pub mod metadata;

/// How a pass talks to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    /// One REST request per item. Simple and always correct.
    Rest,
    /// Aliased GraphQL sub-selections, `batch_size` items per query.
    Graphql { batch_size: usize },
}

/// Counters for one enrichment pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub fetched: u64,
    pub skipped: u64,
    pub not_found: u64,
    pub errors: u64,
    /// Truncated blobs that were completed through the REST fallback.
    pub truncated_rest: u64,
    pub queries: u64,
}

impl PassStats {
    /// Items that reached a terminal state this pass.
    #[must_use]
    pub fn done(&self) -> u64 {
        self.fetched + self.skipped + self.not_found + self.errors + self.truncated_rest
    }
}
