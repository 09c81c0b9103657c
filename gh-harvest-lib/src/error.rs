//! Error types for the gh-harvest library.

/// Top-level error enum.
///
/// Transient upstream conditions (rate limits, 5xx, network drops) are
/// retried inside the client layer and only surface here once the retry
/// limit is exhausted. Per-item permanent failures during enrichment are
/// recorded against the item and never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid base64 content: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A non-retryable upstream response (4xx other than rate limits).
    #[error("GitHub API error {status} for {endpoint}: {message}")]
    Api {
        status: u16,
        endpoint: String,
        message: String,
    },

    /// The bounded retry allowance for 5xx/network failures ran out.
    #[error("request failed after {attempts} attempts: {what}")]
    RetriesExhausted { what: String, attempts: u32 },

    /// A GraphQL response that cannot be interpreted at all.
    #[error("GraphQL error: {0}")]
    GraphQl(String),

    /// A single byte size matches more results than the search cap; the
    /// size axis cannot be subdivided any further.
    #[error("irreducible saturation at size {size}: {count} results for a 1-byte chunk")]
    IrreducibleSaturation { size: u64, count: u64 },
}

impl Error {
    /// Status code of the upstream response, when this error carries one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn irreducible_saturation_names_the_size() {
        let e = Error::IrreducibleSaturation { size: 712, count: 1500 };
        let msg = e.to_string();
        assert!(msg.contains("712"));
        assert!(msg.contains("1500"));
    }

    #[test]
    fn api_error_status_accessor() {
        let e = Error::Api {
            status: 404,
            endpoint: "repos/a/b".to_string(),
            message: "Not Found".to_string(),
        };
        assert_eq!(e.status(), Some(404));
        assert!(Error::Config("x".into()).status().is_none());
    }
}
