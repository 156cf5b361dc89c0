//! Error taxonomy for the wiki crawler.
//!
//! Structural faults ([`WikiError::InvalidSourceUrl`],
//! [`WikiError::MissingCredentials`], [`WikiError::InvalidPollWindow`]) are
//! returned to the caller as-is. Upstream faults are absorbed where the
//! crawler can retry or degrade: [`WikiError::RateLimited`] is consumed by
//! [`RetryPolicy`](crate::rate_limit::RetryPolicy) and only escapes once the
//! retry budget is spent, and [`WikiError::UpstreamFetchFailed`] triggers the
//! per-item pagination fallback.
//!
//! Pages with nothing to index are not errors; they surface as
//! [`SkipReason::EmptyContent`](crate::confluence::SkipReason::EmptyContent).

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WikiError {
    /// The configured wiki URL does not match a known cloud or self-hosted shape.
    #[error(
        "Not a valid Confluence wiki link, unable to extract wiki base, space, and page id: {0}"
    )]
    InvalidSourceUrl(String),

    /// A crawl was started before credentials (or an API client) were attached.
    #[error("{0} connector is missing credentials")]
    MissingCredentials(&'static str),

    /// The poll window bounds are not representable as UTC timestamps.
    #[error("invalid poll window: start={start}, end={end}")]
    InvalidPollWindow { start: i64, end: i64 },

    /// HTTP 429 from the wiki API.
    #[error("rate limited by wiki API (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Any other non-success HTTP status.
    #[error("wiki API request to {url} failed with HTTP {status}")]
    UpstreamFetchFailed { status: u16, url: String },

    #[error("wiki API transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The API answered, but not with something we can read.
    #[error("unexpected wiki API response: {0}")]
    Decode(String),
}

pub type WikiResult<T> = std::result::Result<T, WikiError>;

impl WikiError {
    /// Whether the failure came from an HTTP error status (as opposed to
    /// transport or decoding problems).
    pub fn is_http_status(&self) -> bool {
        matches!(
            self,
            WikiError::UpstreamFetchFailed { .. } | WikiError::RateLimited { .. }
        )
    }
}
