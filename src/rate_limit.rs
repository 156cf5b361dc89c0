//! Rate-limit handling for wiki API calls.
//!
//! Every request the [`ConfluenceClient`](crate::confluence::ConfluenceClient)
//! makes is wrapped by [`RetryPolicy::call`]. An HTTP 429 is mapped to
//! [`WikiError::RateLimited`] by the client; the policy then sleeps and
//! retries:
//!
//! - The server's `Retry-After` (seconds) wins when present.
//! - Otherwise the delay starts at `default_delay` and doubles per attempt.
//! - Every delay is capped at `max_delay`.
//!
//! Other errors are returned untouched on the first occurrence.

use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use tracing::warn;

use crate::config::RateLimitConfig;
use crate::error::{WikiError, WikiResult};

/// Retry budget and backoff schedule for rate-limited calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub default_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            default_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(600),
        }
    }
}

impl From<&RateLimitConfig> for RetryPolicy {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            default_delay: Duration::from_secs(config.default_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
        }
    }
}

impl RetryPolicy {
    /// How long to wait before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = retry_after
            .unwrap_or_else(|| self.default_delay.saturating_mul(1u32 << attempt.min(16)));
        delay.min(self.max_delay)
    }

    /// Run `op`, sleeping and retrying while it reports a rate limit.
    ///
    /// `what` names the call in log lines.
    pub async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> WikiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = WikiResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Err(WikiError::RateLimited { retry_after }) if attempt < self.max_retries => {
                    let delay = self.delay_for(attempt, retry_after);
                    warn!(
                        call = what,
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs_f64(),
                        "rate limited by wiki API, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Parse a `Retry-After` header given in whole seconds.
///
/// HTTP-date values are ignored and fall back to the policy's own schedule.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
