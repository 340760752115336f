//! Crawl error kinds and their propagation policy.
//!
//! One enum covers every failure the crawler surfaces. Most kinds are
//! recoverable: they end one endpoint stream or one step and are recorded in
//! the progress report. Only configuration and unresolvable authentication
//! failures abort the process.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors returned by crawler components.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("no usable account or access token; add one with `glcrawl account add`")]
    AuthMissing,
    #[error("authentication expired: {remediation}")]
    AuthExpired { remediation: String },
    #[error("request to {endpoint} timed out")]
    Timeout { endpoint: String },
    #[error("host unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("HTTP {status} from {endpoint}: {snippet}")]
    HttpStatus {
        status: u16,
        endpoint: String,
        snippet: String,
    },
    #[error("GraphQL errors: {0}")]
    GraphqlErrors(String),
    #[error("callback failed: {0}")]
    Callback(String),
    #[error("write failed for {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not lock {path} within {timeout:?}")]
    LockTimeout { path: PathBuf, timeout: Duration },
    #[error("request failed: {0}")]
    Request(#[from] Box<reqwest::Error>),
    #[error("malformed response: {0}")]
    BadResponse(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for CrawlError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(Box::new(err))
    }
}

impl CrawlError {
    /// Classify a transport failure against the endpoint it targeted.
    ///
    /// Timeouts and connection-level failures get their own kinds so the
    /// paginator and orchestrator can report them distinctly; everything
    /// else stays a generic request error.
    pub fn from_transport(endpoint: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                endpoint: endpoint.to_owned(),
            }
        } else if err.is_connect() {
            Self::NetworkUnreachable(format!("{endpoint}: {err}"))
        } else {
            Self::Request(Box::new(err))
        }
    }

    /// True for kinds that must terminate the process with a non-zero exit.
    ///
    /// Everything else is recorded per step and the crawl keeps moving.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::AuthMissing)
    }

    /// Short machine-readable label used in progress report entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_invalid",
            Self::AuthMissing => "auth_missing",
            Self::AuthExpired { .. } => "auth_expired",
            Self::Timeout { .. } => "timeout",
            Self::NetworkUnreachable(_) => "network_unreachable",
            Self::HttpStatus { .. } => "http_status",
            Self::GraphqlErrors(_) => "graphql_errors",
            Self::Callback(_) => "callback_error",
            Self::Write { .. } => "write_error",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::Request(_) | Self::BadResponse(_) => "request_failed",
            Self::Io(_) => "io_error",
            Self::Yaml(_) | Self::Json(_) => "serialization_error",
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CrawlError>;

#[cfg(test)]
mod tests {
    use super::CrawlError;

    #[test]
    fn config_and_missing_auth_are_fatal() {
        assert!(CrawlError::Config("bad host".into()).is_fatal());
        assert!(CrawlError::AuthMissing.is_fatal());
    }

    #[test]
    fn transport_kinds_are_recoverable() {
        let err = CrawlError::HttpStatus {
            status: 500,
            endpoint: "/api/v4/projects".into(),
            snippet: String::new(),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.kind(), "http_status");
        assert!(!CrawlError::GraphqlErrors("boom".into()).is_fatal());
    }
}
