//! Source catalog adapter for the fan-page collection and ACG detail APIs.

use std::time::Duration;

use serde_json::Value;

use crate::backends::http::{build_agent, get_json_once, request_url};
use crate::backends::{CatalogBackend, CollectionPage, RawDetail};
use crate::config::{CatalogConfig, EndpointsConfig, HttpConfig};
use crate::error::UpstreamError;
use crate::protocol::CollectionEntry;

/// Catalog adapter backed by `ureq`.
pub struct BahamutCatalog {
    http_client: ureq::Agent,
    collection_url: String,
    detail_url: String,
    user_agent: String,
    listing_category: u32,
    timeout: Duration,
}

impl BahamutCatalog {
    pub fn new(endpoints: &EndpointsConfig, http: &HttpConfig, catalog: &CatalogConfig) -> Self {
        Self {
            http_client: build_agent(http.connect_timeout(), http.catalog_timeout()),
            collection_url: endpoints.collection_url.clone(),
            detail_url: endpoints.detail_url.clone(),
            user_agent: endpoints.user_agent.clone(),
            listing_category: catalog.listing_category,
            timeout: http.catalog_timeout(),
        }
    }

    /// Ids arrive as either numbers or strings depending on the endpoint version.
    fn value_as_id(value: &Value) -> Option<String> {
        match value {
            Value::String(text) => {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
    }

    fn optional_text(value: Option<&Value>) -> Option<String> {
        value
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(ToOwned::to_owned)
    }

    pub(crate) fn parse_collection_page(payload: &Value) -> Option<CollectionPage> {
        let data = payload.get("data")?;
        let total_pages = data
            .get("tpage")
            .and_then(|value| {
                value
                    .as_u64()
                    .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
            })
            .unwrap_or(1)
            .clamp(1, u64::from(u32::MAX)) as u32;
        let entries = data
            .get("list")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some(CollectionEntry {
                            id: Self::value_as_id(item.get("id")?)?,
                            name: item
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(CollectionPage {
            entries,
            total_pages,
        })
    }

    pub(crate) fn parse_detail(payload: &Value) -> Vec<RawDetail> {
        let Some(all) = payload
            .get("data")
            .and_then(|value| value.get("acg"))
            .and_then(|value| value.get("all"))
            .and_then(Value::as_object)
        else {
            return Vec::new();
        };

        all.values()
            .map(|info| {
                let detailed = info.get("detailed");
                RawDetail {
                    title: info
                        .get("title")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    title_en: Self::optional_text(info.get("title_en")),
                    title_jp: Self::optional_text(info.get("title_jp")),
                    category: Self::optional_text(
                        detailed
                            .and_then(|value| value.get("platform"))
                            .and_then(|value| value.get("value")),
                    ),
                    debut: Self::optional_text(
                        detailed
                            .and_then(|value| value.get("localDebut"))
                            .and_then(|value| value.get("value")),
                    ),
                }
            })
            .collect()
    }
}

impl CatalogBackend for BahamutCatalog {
    fn fetch_collection_page(
        &self,
        user_id: &str,
        shard: &str,
        page: u32,
    ) -> Result<CollectionPage, UpstreamError> {
        let page_text = page.to_string();
        let category_text = self.listing_category.to_string();
        let url = request_url(
            &self.collection_url,
            &[
                ("userid", user_id),
                ("kind", shard),
                ("page", &page_text),
                ("category", &category_text),
            ],
        );
        let payload = get_json_once(&self.http_client, &url, &self.user_agent, self.timeout)?;
        Self::parse_collection_page(&payload)
            .ok_or_else(|| UpstreamError::Decode("collection response has no data".to_string()))
    }

    fn fetch_detail(&self, source_id: &str) -> Result<Vec<RawDetail>, UpstreamError> {
        let url = request_url(&self.detail_url, &[("sn", source_id)]);
        let payload = get_json_once(&self.http_client, &url, &self.user_agent, self.timeout)?;
        Ok(Self::parse_detail(&payload))
    }
}
