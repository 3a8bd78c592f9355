//! Records and events shared by all pipeline components.
//!
//! This module defines the typed payloads passed between the catalog gateway,
//! the resolver, the caches, the acquisition pipeline, and the export writer.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Image shown for identities that carry no artwork of their own.
pub const PLACEHOLDER_IMAGE_URL: &str =
    "https://cdn.myanimelist.net/img/sp/icon/apple-touch-icon-256.png";

/// Date distance assigned when either side of the comparison has no usable date.
pub const DATE_DIFF_UNKNOWN: i64 = 99_999;

/// One `{id, name}` pair from the collection listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub id: String,
    pub name: String,
}

/// Typed detail record for one source catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source_id: String,
    /// Localized title; also the identity cache key.
    pub local_title: String,
    /// Native-language alternate title.
    pub native_title: Option<String>,
    /// Secondary-language alternate title.
    pub secondary_title: Option<String>,
    pub debut_year: Option<i32>,
    pub debut_month: Option<u32>,
    pub debut_day: Option<u32>,
}

impl SourceRecord {
    /// Complete, valid debut date, if all three parts parsed.
    pub fn debut_date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.debut_year?, self.debut_month?, self.debut_day?)
    }
}

/// Search result considered during resolution. Dropped once a winner is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateMatch {
    pub canonical_id: u64,
    pub canonical_title: String,
    pub image_url: String,
    pub date_diff_days: i64,
    /// Lower is preferred; the native-language query is 1.
    pub query_priority: u8,
    /// Zero-based position in the search response.
    pub result_rank: usize,
}

/// Confidence classification attached to a resolution result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    CacheHit,
    HighConfidence,
    LowConfidenceDate,
    LowConfidenceNoAudio,
    NotFound,
}

impl ConfidenceTier {
    pub fn label(self) -> &'static str {
        match self {
            Self::CacheHit => "Cache Hit",
            Self::HighConfidence => "High Confidence",
            Self::LowConfidenceDate => "Low Confidence (Date)",
            Self::LowConfidenceNoAudio => "Low Confidence (No Audio)",
            Self::NotFound => "Not Found",
        }
    }

    /// Rows in these tiers need a human look before import.
    pub fn is_low(self) -> bool {
        !matches!(self, Self::CacheHit | Self::HighConfidence)
    }
}

/// Canonical identity chosen for one source record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub canonical_id: u64,
    pub canonical_title: String,
    pub image_url: String,
    pub tier: ConfidenceTier,
    /// Air-date distance of the winning candidate. `None` on cache hits.
    pub date_diff_days: Option<i64>,
}

impl ResolvedIdentity {
    pub fn canonical_url(&self) -> String {
        format!("https://myanimelist.net/anime/{}", self.canonical_id)
    }
}

/// One downloadable theme song.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaLink {
    #[serde(rename = "type")]
    pub theme_type: String,
    #[serde(rename = "title")]
    pub song_title: String,
    #[serde(rename = "link")]
    pub source_url: String,
}

/// Identity handed to the acquisition pipeline and the export writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionTarget {
    pub canonical_id: u64,
    pub title: String,
}

impl From<&ResolvedIdentity> for AcquisitionTarget {
    fn from(identity: &ResolvedIdentity) -> Self {
        Self {
            canonical_id: identity.canonical_id,
            title: identity.canonical_title.clone(),
        }
    }
}

/// Per-identity download summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionResult {
    pub folder_name: String,
    pub files_written: usize,
}

/// Outcome of one item inside a best-effort batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    Skipped,
    Failed(String),
}

/// Aggregated item outcomes of one batch stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub skipped: usize,
    /// `(item label, reason)` pairs.
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn record(&mut self, label: impl Into<String>, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded => self.succeeded += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Failed(reason) => self.failed.push((label.into(), reason)),
        }
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.succeeded += other.succeeded;
        self.skipped += other.skipped;
        self.failed.extend(other.failed);
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.skipped + self.failed.len()
    }
}

/// One row of a resolution batch, in the shape the presentation layer renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRow {
    pub row_index: usize,
    pub source_title: String,
    /// Canonical title, or `-` when nothing was found.
    pub canonical_title: String,
    pub canonical_id: Option<u64>,
    pub tier: ConfidenceTier,
    pub status: String,
    pub image_url: String,
    pub is_low: bool,
}

/// Progress notification emitted by the acquisition pipeline.
///
/// The stream always ends with either `Finished` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        identities: usize,
        progress: u8,
    },
    /// Media links located for one identity.
    Searched {
        title: String,
        themes: usize,
        completed: usize,
        total: usize,
        progress: u8,
    },
    /// Identity has no media; not an error.
    Skipped {
        title: String,
        completed: usize,
        total: usize,
        progress: u8,
    },
    DownloadsQueued {
        files: usize,
        progress: u8,
    },
    Downloaded {
        file: String,
        ok: bool,
        completed: usize,
        total: usize,
        progress: u8,
    },
    Packaging {
        progress: u8,
    },
    Finished {
        filename: String,
        results: Vec<AcquisitionResult>,
        report: BatchReport,
        progress: u8,
    },
    Failed {
        error: String,
        no_media: bool,
    },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::{BatchReport, ConfidenceTier, ItemOutcome, ProgressEvent, SourceRecord};

    fn record(year: Option<i32>, month: Option<u32>, day: Option<u32>) -> SourceRecord {
        SourceRecord {
            source_id: "1".to_string(),
            local_title: "Sample".to_string(),
            native_title: None,
            secondary_title: None,
            debut_year: year,
            debut_month: month,
            debut_day: day,
        }
    }

    #[test]
    fn test_debut_date_requires_all_parts() {
        assert!(record(Some(2020), Some(4), Some(1)).debut_date().is_some());
        assert!(record(Some(2020), Some(4), None).debut_date().is_none());
        assert!(record(Some(2020), Some(13), Some(1)).debut_date().is_none());
    }

    #[test]
    fn test_only_cache_hit_and_high_confidence_are_not_low() {
        assert!(!ConfidenceTier::CacheHit.is_low());
        assert!(!ConfidenceTier::HighConfidence.is_low());
        assert!(ConfidenceTier::LowConfidenceDate.is_low());
        assert!(ConfidenceTier::LowConfidenceNoAudio.is_low());
        assert!(ConfidenceTier::NotFound.is_low());
    }

    #[test]
    fn test_batch_report_counts_outcomes() {
        let mut report = BatchReport::default();
        report.record("a", ItemOutcome::Succeeded);
        report.record("b", ItemOutcome::Skipped);
        report.record("c", ItemOutcome::Failed("boom".to_string()));

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, vec![("c".to_string(), "boom".to_string())]);
        assert_eq!(report.total(), 3);
    }

    #[test]
    fn test_progress_event_serializes_with_event_tag() {
        let event = ProgressEvent::Packaging { progress: 95 };
        let json = serde_json::to_value(&event).expect("event should serialize");
        assert_eq!(json["event"], "packaging");
        assert_eq!(json["progress"], 95);
        assert!(!event.is_terminal());
    }
}
