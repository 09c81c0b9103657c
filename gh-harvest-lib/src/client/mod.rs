//! Rate-limited, cached access to the GitHub REST and GraphQL APIs.
//!
//! This module is the sole egress point to the upstream service. All
//! traffic is shaped by a per-API-family [`pacer::Pacer`], transient
//! failures are retried, and responses flow through the persistent
//! [`cache::ResponseCache`].

mod cache;
mod graphql;
mod pacer;
mod rest;

pub use cache::{CacheStats, ResponseCache, WrappedEntry};
pub use graphql::GraphqlClient;
pub use pacer::Pacer;
pub use rest::{ApiResponse, RestClient, API_BASE};

/// Steady-state REST request rate: 1.3 req/sec is ~4,680/hour, holding
/// under the 5,000/hour primary limit without bursts that trip the
/// secondary abuse detection.
pub const REST_REQUESTS_PER_SECOND: f64 = 1.3;

/// GraphQL request rate: 30/sec is 1,800/min, under the ~2,000/min
/// secondary limit.
pub const GRAPHQL_REQUESTS_PER_SECOND: f64 = 30.0;
