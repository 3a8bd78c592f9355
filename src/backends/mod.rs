//! Upstream service abstractions and concrete HTTP implementations.
//!
//! Every consumed API sits behind a trait so the gateway, resolver, caches,
//! and acquisition pipeline can be driven by in-memory fakes in tests.

pub mod animethemes;
pub mod bahamut;
pub mod http;
pub mod jikan;

use std::io::Write;
use std::time::Duration;

use log::info;

use crate::error::UpstreamError;
use crate::protocol::{CollectionEntry, MediaLink};

/// One page of a collection listing shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionPage {
    pub entries: Vec<CollectionEntry>,
    /// Page count reported by the shard; at least 1.
    pub total_pages: u32,
}

/// Unfiltered detail entry as returned by the catalog detail API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDetail {
    pub title: String,
    pub title_en: Option<String>,
    pub title_jp: Option<String>,
    pub category: Option<String>,
    pub debut: Option<String>,
}

/// Ranked hit from the fuzzy search API, in response order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchHit {
    pub canonical_id: u64,
    pub title: String,
    pub release_type: Option<String>,
    pub aired_from: Option<String>,
    pub image_url: Option<String>,
}

/// Source catalog: collection listing and per-entry detail.
pub trait CatalogBackend: Send + Sync {
    fn fetch_collection_page(
        &self,
        user_id: &str,
        shard: &str,
        page: u32,
    ) -> Result<CollectionPage, UpstreamError>;
    fn fetch_detail(&self, source_id: &str) -> Result<Vec<RawDetail>, UpstreamError>;
}

/// Fuzzy title search against the canonical database.
pub trait AnimeSearch: Send + Sync {
    fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchHit>, UpstreamError>;
}

/// Theme-song index keyed by canonical id.
pub trait MediaIndex: Send + Sync {
    fn fetch_themes(&self, canonical_id: u64) -> Result<Vec<MediaLink>, UpstreamError>;
}

/// Streams one remote file into a sink, returning the byte count.
pub trait MediaFetcher: Send + Sync {
    fn fetch_to(&self, url: &str, sink: &mut dyn Write) -> Result<u64, UpstreamError>;
}

/// Bounded retry schedule applied to HTTP 429 responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            ceiling: Duration::from_secs(16),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &crate::config::ResolverConfig) -> Self {
        Self {
            max_attempts: config.max_rate_limit_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            ceiling: Duration::from_millis(config.backoff_ceiling_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based): base doubled per attempt, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(6);
        let multiplier = 1u32 << exponent;
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }
}

/// Runs `operation`, retrying only on rate limiting, at most `max_attempts` times.
///
/// Exhaustion yields `UpstreamError::RateLimited` carrying the attempt count.
pub fn with_rate_limit_retry<T, F>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Result<T, UpstreamError>,
{
    let mut attempt = 1u32;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) if error.is_rate_limited() => {
                if attempt >= policy.max_attempts {
                    return Err(UpstreamError::RateLimited { attempts: attempt });
                }
                let backoff = policy.backoff_delay(attempt);
                info!(
                    "{}: attempt {} rate limited, retrying in {:?}",
                    label, attempt, backoff
                );
                std::thread::sleep(backoff);
                attempt = attempt.saturating_add(1);
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use super::{with_rate_limit_retry, RetryPolicy};
    use crate::error::UpstreamError;

    fn instant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            ceiling: Duration::ZERO,
        }
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(3),
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(2_000));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(3));
        assert_eq!(policy.backoff_delay(40), Duration::from_secs(3));
    }

    #[test]
    fn test_retry_gives_up_after_max_attempts() {
        let calls = Cell::new(0u32);
        let result: Result<(), UpstreamError> =
            with_rate_limit_retry(&instant_policy(3), "test", || {
                calls.set(calls.get() + 1);
                Err(UpstreamError::RateLimited { attempts: 1 })
            });

        assert_eq!(calls.get(), 3);
        assert_eq!(result, Err(UpstreamError::RateLimited { attempts: 3 }));
    }

    #[test]
    fn test_retry_recovers_after_rate_limit() {
        let calls = Cell::new(0u32);
        let result = with_rate_limit_retry(&instant_policy(4), "test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(UpstreamError::RateLimited { attempts: 1 })
            } else {
                Ok(7)
            }
        });

        assert_eq!(result, Ok(7));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_does_not_repeat_other_failures() {
        let calls = Cell::new(0u32);
        let result: Result<(), UpstreamError> =
            with_rate_limit_retry(&instant_policy(4), "test", || {
                calls.set(calls.get() + 1);
                Err(UpstreamError::Status(500))
            });

        assert_eq!(calls.get(), 1);
        assert_eq!(result, Err(UpstreamError::Status(500)));
    }
}
