//! Candidate resolution: identity cache, fuzzy search, date tie-break, tiering.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use log::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;

use crate::asset_cache::AssetIndexCache;
use crate::backends::{AnimeSearch, SearchHit};
use crate::config::ResolverConfig;
use crate::error::UpstreamError;
use crate::identity_cache::IdentityCache;
use crate::protocol::{
    BatchReport, CandidateMatch, ConfidenceTier, ItemOutcome, ResolvedIdentity, ResolvedRow,
    SourceRecord, DATE_DIFF_UNKNOWN, PLACEHOLDER_IMAGE_URL,
};
use crate::worker_pool::run_bounded;

const MARKETING_PREFIX: &str = "劇場版";
const ALLOWED_RELEASE_TYPES: [&str; 6] = ["TV", "MOVIE", "OVA", "TV SPECIAL", "ONA", "SPECIAL"];
const NOT_FOUND_TITLE: &str = "-";

/// Normalizes a title for searching: NFKC, marketing prefix removed, trimmed.
pub fn clean_query(title: &str) -> String {
    let normalized: String = title.nfkc().collect();
    normalized.replace(MARKETING_PREFIX, "").trim().to_string()
}

fn is_allowed_release_type(release_type: Option<&str>) -> bool {
    release_type
        .map(|kind| kind.trim().to_uppercase())
        .is_some_and(|kind| ALLOWED_RELEASE_TYPES.contains(&kind.as_str()))
}

/// Absolute day distance between an ISO timestamp's date part and `target`.
///
/// Returns [`DATE_DIFF_UNKNOWN`] when either side is missing or unparseable.
pub fn date_diff_days(aired_from: Option<&str>, target: Option<NaiveDate>) -> i64 {
    let (Some(aired_from), Some(target)) = (aired_from, target) else {
        return DATE_DIFF_UNKNOWN;
    };
    let date_part = aired_from.split('T').next().unwrap_or_default().trim();
    match NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
        Ok(aired) => (aired - target).num_days().abs(),
        Err(_) => DATE_DIFF_UNKNOWN,
    }
}

/// Per-record progress handed to [`Resolver::resolve_batch`] callers.
#[derive(Debug, Clone, Copy)]
pub struct ResolveProgress<'a> {
    pub completed: usize,
    pub total: usize,
    pub row: &'a ResolvedRow,
}

struct Resolution {
    identity: Option<ResolvedIdentity>,
    tier: ConfidenceTier,
    query_count: usize,
    search_errors: Vec<UpstreamError>,
}

impl Resolution {
    fn outcome(&self) -> ItemOutcome {
        if self.identity.is_some() {
            return ItemOutcome::Succeeded;
        }
        match self.search_errors.first() {
            Some(err) if self.search_errors.len() == self.query_count => {
                ItemOutcome::Failed(err.to_string())
            }
            _ => ItemOutcome::Skipped,
        }
    }
}

pub struct Resolver {
    identity_cache: Arc<IdentityCache>,
    asset_cache: Arc<AssetIndexCache>,
    search: Arc<dyn AnimeSearch>,
    search_limit: u32,
    date_window_days: i64,
    workers: usize,
}

impl Resolver {
    pub fn new(
        identity_cache: Arc<IdentityCache>,
        asset_cache: Arc<AssetIndexCache>,
        search: Arc<dyn AnimeSearch>,
        config: &ResolverConfig,
    ) -> Self {
        Self {
            identity_cache,
            asset_cache,
            search,
            search_limit: config.search_limit.max(1),
            date_window_days: config.date_window_days.max(0),
            workers: config.resolve_workers.max(1),
        }
    }

    /// Priority-ordered queries: native title first, then the secondary title.
    fn queries_for(record: &SourceRecord) -> Vec<(u8, String)> {
        let mut seen = HashSet::new();
        [&record.native_title, &record.secondary_title]
            .into_iter()
            .zip(1u8..)
            .filter_map(|(title, priority)| {
                let query = clean_query(title.as_deref()?);
                (!query.is_empty() && seen.insert(query.clone())).then_some((priority, query))
            })
            .collect()
    }

    fn candidate_from_hit(
        hit: SearchHit,
        priority: u8,
        rank: usize,
        target: Option<NaiveDate>,
    ) -> CandidateMatch {
        CandidateMatch {
            canonical_id: hit.canonical_id,
            canonical_title: hit.title,
            image_url: hit.image_url.unwrap_or_default(),
            date_diff_days: date_diff_days(hit.aired_from.as_deref(), target),
            query_priority: priority,
            result_rank: rank,
        }
    }

    /// Runs every query and returns the filtered, id-deduplicated candidates.
    fn collect_candidates(
        &self,
        record: &SourceRecord,
    ) -> (Vec<CandidateMatch>, usize, Vec<UpstreamError>) {
        let target = record.debut_date();
        let queries = Self::queries_for(record);
        let query_count = queries.len();
        let mut seen_ids = HashSet::new();
        let mut candidates = Vec::new();
        let mut errors = Vec::new();

        for (priority, query) in queries {
            let hits = match self.search.search(&query, self.search_limit) {
                Ok(hits) => hits,
                Err(err) => {
                    warn!("Resolve[{}]: search '{}' failed: {}", record.source_id, query, err);
                    errors.push(err);
                    continue;
                }
            };
            for (rank, hit) in hits.into_iter().enumerate() {
                if !is_allowed_release_type(hit.release_type.as_deref()) {
                    continue;
                }
                if !seen_ids.insert(hit.canonical_id) {
                    continue;
                }
                candidates.push(Self::candidate_from_hit(hit, priority, rank, target));
            }
        }
        (candidates, query_count, errors)
    }

    fn is_date_confirmed(&self, candidate: &CandidateMatch) -> bool {
        candidate.date_diff_days != DATE_DIFF_UNKNOWN
            && candidate.date_diff_days <= self.date_window_days
    }

    /// Date-confirmed candidates first, then lower rank, then lower query priority.
    fn select_winner(&self, candidates: Vec<CandidateMatch>) -> Option<CandidateMatch> {
        candidates.into_iter().min_by_key(|candidate| {
            (
                !self.is_date_confirmed(candidate),
                candidate.result_rank,
                candidate.query_priority,
            )
        })
    }

    fn resolve_inner(&self, record: &SourceRecord) -> Resolution {
        if let Some(identity) = self.identity_cache.lookup(&record.local_title) {
            debug!("Resolve[{}]: cache hit -> {}", record.source_id, identity.canonical_id);
            return Resolution {
                identity: Some(identity),
                tier: ConfidenceTier::CacheHit,
                query_count: 0,
                search_errors: Vec::new(),
            };
        }

        let (candidates, query_count, search_errors) = self.collect_candidates(record);
        let Some(winner) = self.select_winner(candidates) else {
            debug!("Resolve[{}]: no candidates", record.source_id);
            return Resolution {
                identity: None,
                tier: ConfidenceTier::NotFound,
                query_count,
                search_errors,
            };
        };

        let date_confirmed = self.is_date_confirmed(&winner);
        let has_assets = !self.asset_cache.get_assets(winner.canonical_id).is_empty();
        let tier = match (date_confirmed, has_assets) {
            (true, true) => ConfidenceTier::HighConfidence,
            (true, false) => ConfidenceTier::LowConfidenceNoAudio,
            (false, _) => ConfidenceTier::LowConfidenceDate,
        };
        debug!(
            "Resolve[{}]: {} -> {} ({}, diff {} days)",
            record.source_id,
            record.local_title,
            winner.canonical_id,
            tier.label(),
            winner.date_diff_days
        );

        Resolution {
            identity: Some(ResolvedIdentity {
                canonical_id: winner.canonical_id,
                canonical_title: winner.canonical_title,
                image_url: winner.image_url,
                tier,
                date_diff_days: Some(winner.date_diff_days),
            }),
            tier,
            query_count,
            search_errors,
        }
    }

    /// Resolves one record to a canonical identity and its confidence tier.
    pub fn resolve(&self, record: &SourceRecord) -> (Option<ResolvedIdentity>, ConfidenceTier) {
        let resolution = self.resolve_inner(record);
        (resolution.identity, resolution.tier)
    }

    fn row_for(row_index: usize, record: &SourceRecord, resolution: &Resolution) -> ResolvedRow {
        let identity = resolution.identity.as_ref();
        ResolvedRow {
            row_index,
            source_title: record.local_title.clone(),
            canonical_title: identity
                .map(|identity| identity.canonical_title.clone())
                .filter(|title| !title.is_empty())
                .unwrap_or_else(|| NOT_FOUND_TITLE.to_string()),
            canonical_id: identity.map(|identity| identity.canonical_id),
            tier: resolution.tier,
            status: resolution.tier.label().to_string(),
            image_url: identity
                .map(|identity| identity.image_url.clone())
                .filter(|url| !url.is_empty())
                .unwrap_or_else(|| PLACEHOLDER_IMAGE_URL.to_string()),
            is_low: resolution.tier.is_low(),
        }
    }

    /// Resolves `records` in parallel and returns rows in input order.
    ///
    /// `on_progress` runs on the calling thread once per record, in completion order.
    /// Not-found records count as skipped; they count as failed only when every
    /// search for them errored.
    pub fn resolve_batch<F>(
        &self,
        records: &[SourceRecord],
        mut on_progress: F,
    ) -> (Vec<ResolvedRow>, Vec<Option<ResolvedIdentity>>, BatchReport)
    where
        F: FnMut(ResolveProgress<'_>),
    {
        let total = records.len();
        let mut rows: Vec<Option<ResolvedRow>> = vec![None; total];
        let mut identities: Vec<Option<ResolvedIdentity>> = vec![None; total];
        let mut report = BatchReport::default();
        let mut completed = 0;

        run_bounded(
            records.iter().collect(),
            self.workers,
            |record| self.resolve_inner(record),
            |index, resolution| {
                completed += 1;
                let record = &records[index];
                let row = Self::row_for(index, record, &resolution);
                report.record(record.local_title.clone(), resolution.outcome());
                on_progress(ResolveProgress {
                    completed,
                    total,
                    row: &row,
                });
                rows[index] = Some(row);
                identities[index] = resolution.identity;
            },
        );

        info!(
            "Resolve[batch]: {} record(s), {} resolved, {} not found, {} failed",
            total,
            report.succeeded,
            report.skipped,
            report.failed.len()
        );
        (rows.into_iter().flatten().collect(), identities, report)
    }
}
