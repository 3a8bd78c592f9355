//! Fuzzy search adapter for the Jikan anime API.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::debug;
use serde_json::Value;

use crate::backends::http::{build_agent, get_json_once, request_url};
use crate::backends::{with_rate_limit_retry, AnimeSearch, RetryPolicy, SearchHit};
use crate::config::{EndpointsConfig, HttpConfig, ResolverConfig};
use crate::error::UpstreamError;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Search adapter that spaces calls by a fixed delay shared across all workers.
pub struct JikanSearch {
    http_client: ureq::Agent,
    search_url: String,
    user_agent: String,
    timeout: Duration,
    retry: RetryPolicy,
    limiter: DirectLimiter,
    clock: DefaultClock,
}

impl JikanSearch {
    pub fn new(endpoints: &EndpointsConfig, http: &HttpConfig, resolver: &ResolverConfig) -> Self {
        let period = Duration::from_millis(resolver.search_delay_ms.max(1));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::MIN);
        Self {
            http_client: build_agent(http.connect_timeout(), http.search_timeout()),
            search_url: endpoints.search_url.clone(),
            user_agent: endpoints.user_agent.clone(),
            timeout: http.search_timeout(),
            retry: RetryPolicy::from_config(resolver),
            limiter: RateLimiter::direct(quota),
            clock: DefaultClock::default(),
        }
    }

    /// Blocks the calling worker until the limiter grants the next call slot.
    fn wait_for_slot(&self) {
        while let Err(not_until) = self.limiter.check() {
            std::thread::sleep(not_until.wait_time_from(self.clock.now()));
        }
    }

    pub(crate) fn parse_hits(payload: &Value) -> Vec<SearchHit> {
        payload
            .get("data")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some(SearchHit {
                            canonical_id: item.get("mal_id")?.as_u64()?,
                            title: item
                                .get("title")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            release_type: item
                                .get("type")
                                .and_then(Value::as_str)
                                .map(ToOwned::to_owned),
                            aired_from: item
                                .get("aired")
                                .and_then(|aired| aired.get("from"))
                                .and_then(Value::as_str)
                                .map(ToOwned::to_owned),
                            image_url: item
                                .get("images")
                                .and_then(|images| images.get("jpg"))
                                .and_then(|jpg| jpg.get("image_url"))
                                .and_then(Value::as_str)
                                .filter(|url| !url.is_empty())
                                .map(ToOwned::to_owned),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl AnimeSearch for JikanSearch {
    fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchHit>, UpstreamError> {
        let limit_text = limit.to_string();
        let url = request_url(&self.search_url, &[("q", query), ("limit", &limit_text)]);
        let payload = with_rate_limit_retry(&self.retry, "Resolve[search]", || {
            self.wait_for_slot();
            get_json_once(&self.http_client, &url, &self.user_agent, self.timeout)
        })?;
        let hits = Self::parse_hits(&payload);
        debug!("Resolve[search]: '{}' returned {} hit(s)", query, hits.len());
        Ok(hits)
    }
}
