//! Retry configuration and policy for host requests.

use backon::ExponentialBuilder;
use tokio::time::Duration;

use crate::error::CrawlError;

/// Configuration for retrying transient request failures.
#[derive(Clone, Copy)]
pub struct RetryConfig {
    /// Total number of attempts including the initial request.
    pub attempts: usize,
    /// Base delay for the exponential backoff.
    pub base_delay: Duration,
    /// Whether to jitter the backoff delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
            jitter: true,
        }
    }
}

pub fn build_retry_builder(config: RetryConfig) -> ExponentialBuilder {
    let builder = ExponentialBuilder::default()
        .with_min_delay(config.base_delay)
        .with_max_times(config.attempts);
    if config.jitter {
        builder.with_jitter()
    } else {
        builder
    }
}

/// True for failures worth another attempt.
///
/// Authentication failures are excluded: the 401 path owns its single
/// refresh-and-retry and everything left after that is terminal.
pub fn should_retry(err: &CrawlError) -> bool {
    match err {
        CrawlError::Timeout { .. }
        | CrawlError::NetworkUnreachable(_)
        | CrawlError::Request(_) => true,
        CrawlError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
        _ => false,
    }
}
