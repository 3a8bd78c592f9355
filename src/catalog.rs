//! Source catalog gateway: sharded collection listing and per-entry details.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::backends::{CatalogBackend, RawDetail};
use crate::config::CatalogConfig;
use crate::error::UpstreamError;
use crate::protocol::{BatchReport, CollectionEntry, ItemOutcome, SourceRecord};
use crate::worker_pool::map_bounded;

/// Deduplicated collection listing plus per-page outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionListing {
    pub entries: Vec<CollectionEntry>,
    pub report: BatchReport,
}

/// Typed detail records in listing order plus per-entry outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailBatch {
    pub records: Vec<SourceRecord>,
    pub report: BatchReport,
}

fn parse_digits<T: std::str::FromStr>(part: Option<&str>) -> Option<T> {
    let part = part?;
    if part.is_empty() || !part.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

/// Splits a `YYYY-MM-DD` debut string, dropping every part that is not all digits.
///
/// The day is everything from the ninth character on, so trailing text
/// invalidates only the day.
pub fn parse_debut_date(value: Option<&str>) -> (Option<i32>, Option<u32>, Option<u32>) {
    let Some(value) = value.map(str::trim) else {
        return (None, None, None);
    };
    let year = parse_digits(value.get(0..4));
    let month = if value.len() >= 7 {
        parse_digits(value.get(5..7))
    } else {
        None
    };
    let day = if value.len() >= 10 {
        parse_digits(value.get(8..))
    } else {
        None
    };
    (year, month, day)
}

pub struct CatalogGateway {
    backend: Arc<dyn CatalogBackend>,
    rating_shards: Vec<String>,
    detail_workers: usize,
    detail_category: String,
}

impl CatalogGateway {
    pub fn new(backend: Arc<dyn CatalogBackend>, config: &CatalogConfig) -> Self {
        Self {
            backend,
            rating_shards: config.rating_shards.clone(),
            detail_workers: config.detail_workers.max(1),
            detail_category: config.detail_category.clone(),
        }
    }

    /// Lists every collected entry across all rating shards.
    ///
    /// Each shard paginates independently; a failed page is recorded and
    /// skipped. Entries are deduplicated by id with the last occurrence winning,
    /// kept at the position of the first occurrence.
    pub fn list_collection_ids(&self, user_id: &str) -> CollectionListing {
        let mut report = BatchReport::default();
        let mut entries: Vec<CollectionEntry> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut accept = |entry: CollectionEntry| match positions.get(&entry.id) {
            Some(&position) => entries[position] = entry,
            None => {
                positions.insert(entry.id.clone(), entries.len());
                entries.push(entry);
            }
        };

        for shard in &self.rating_shards {
            let first = match self.backend.fetch_collection_page(user_id, shard, 1) {
                Ok(page) => page,
                Err(err) => {
                    warn!("Catalog[{}]: shard {} page 1 failed: {}", user_id, shard, err);
                    report.record(format!("{shard}#1"), ItemOutcome::Failed(err.to_string()));
                    continue;
                }
            };
            report.record(format!("{shard}#1"), ItemOutcome::Succeeded);
            let total_pages = first.total_pages.max(1);
            first.entries.into_iter().for_each(&mut accept);

            for page in 2..=total_pages {
                match self.backend.fetch_collection_page(user_id, shard, page) {
                    Ok(next) => {
                        report.record(format!("{shard}#{page}"), ItemOutcome::Succeeded);
                        next.entries.into_iter().for_each(&mut accept);
                    }
                    Err(err) => {
                        warn!(
                            "Catalog[{}]: shard {} page {} failed: {}",
                            user_id, shard, page, err
                        );
                        report.record(
                            format!("{shard}#{page}"),
                            ItemOutcome::Failed(err.to_string()),
                        );
                    }
                }
            }
        }

        info!(
            "Catalog[{}]: {} unique entries ({} pages ok, {} failed)",
            user_id,
            entries.len(),
            report.succeeded,
            report.failed.len()
        );
        CollectionListing { entries, report }
    }

    fn record_from_detail(&self, source_id: &str, detail: RawDetail) -> SourceRecord {
        let (debut_year, debut_month, debut_day) = parse_debut_date(detail.debut.as_deref());
        SourceRecord {
            source_id: source_id.to_string(),
            local_title: detail.title.trim().to_string(),
            native_title: detail.title_jp,
            secondary_title: detail.title_en,
            debut_year,
            debut_month,
            debut_day,
        }
    }

    /// Fetches one entry's detail, keeping only the configured category.
    pub fn fetch_detail(&self, source_id: &str) -> Result<Option<SourceRecord>, UpstreamError> {
        let details = self.backend.fetch_detail(source_id)?;
        Ok(details
            .into_iter()
            .find(|detail| detail.category.as_deref() == Some(self.detail_category.as_str()))
            .map(|detail| self.record_from_detail(source_id, detail)))
    }

    /// Fetches details with bounded parallelism. Failed or absent entries are dropped.
    pub fn fetch_all_details(&self, entries: &[CollectionEntry]) -> DetailBatch {
        let ids: Vec<&CollectionEntry> = entries.iter().collect();
        let outcomes = map_bounded(ids, self.detail_workers, |entry| {
            (entry, self.fetch_detail(&entry.id))
        });

        let mut batch = DetailBatch::default();
        for (entry, outcome) in outcomes {
            match outcome {
                Ok(Some(record)) => {
                    batch.report.record(entry.id.clone(), ItemOutcome::Succeeded);
                    batch.records.push(record);
                }
                Ok(None) => {
                    debug!("Catalog[{}]: no {} detail", entry.id, self.detail_category);
                    batch.report.record(entry.id.clone(), ItemOutcome::Skipped);
                }
                Err(err) => {
                    warn!("Catalog[{}]: detail failed: {}", entry.id, err);
                    batch
                        .report
                        .record(entry.id.clone(), ItemOutcome::Failed(err.to_string()));
                }
            }
        }
        info!(
            "Catalog: {} detail record(s), {} skipped, {} failed",
            batch.records.len(),
            batch.report.skipped,
            batch.report.failed.len()
        );
        batch
    }
}
