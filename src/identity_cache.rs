//! Disk-backed source-title to canonical-identity map.
//!
//! The file is a human-editable CSV with the header
//! `ch_name,mal_id,mal_title,img_url`. It is loaded once and never written
//! back by resolution; entries are authoritative and never invalidated.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{info, warn};
use serde::Deserialize;

use crate::error::CacheError;
use crate::protocol::{ConfidenceTier, ResolvedIdentity, PLACEHOLDER_IMAGE_URL};

const IDENTITY_CACHE_HEADER: [&str; 4] = ["ch_name", "mal_id", "mal_title", "img_url"];
const EXCLUDE_MARK: &str = "X";

/// One persisted cache row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCacheEntry {
    pub canonical_id: u64,
    pub canonical_title: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdentityCacheRow {
    #[serde(default)]
    ch_name: Option<String>,
    #[serde(default)]
    mal_id: Option<String>,
    #[serde(default)]
    mal_title: Option<String>,
    #[serde(default)]
    img_url: Option<String>,
}

/// Reviewed candidate row offered for merging into the cache file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRow {
    pub source_title: String,
    pub canonical_id: String,
    pub canonical_title: String,
    pub image_url: String,
    /// `X` excludes the row from the merge.
    pub check_mark: String,
}

/// Counters reported by [`IdentityCache::merge_into_file`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub duplicates: usize,
    pub excluded: usize,
}

/// Read-only identity map, safe to share between resolver workers.
#[derive(Debug, Default)]
pub struct IdentityCache {
    entries: HashMap<String, IdentityCacheEntry>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn read_without_bom(path: &Path) -> Result<String, CacheError> {
    let content = fs::read_to_string(path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(content
        .strip_prefix('\u{feff}')
        .map(ToOwned::to_owned)
        .unwrap_or(content))
}

fn ends_with_newline(path: &Path) -> io::Result<bool> {
    let mut file = fs::File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

impl IdentityCache {
    /// Loads the cache, degrading to an empty map when the file is missing or unreadable.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!(
                "Identity cache {} not found, starting cold",
                path.display()
            );
            return Self::default();
        }
        match Self::try_load(path) {
            Ok(cache) => {
                info!(
                    "Identity cache loaded {} entries from {}",
                    cache.len(),
                    path.display()
                );
                cache
            }
            Err(err) => {
                warn!("Identity cache degraded to empty: {}", err);
                Self::default()
            }
        }
    }

    fn try_load(path: &Path) -> Result<Self, CacheError> {
        let content = read_without_bom(path)?;
        Self::from_csv_str(&content)
    }

    pub fn from_csv_str(content: &str) -> Result<Self, CacheError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());
        let mut entries = HashMap::new();
        for row in reader.deserialize::<IdentityCacheRow>() {
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    warn!("Identity cache skipped malformed row: {}", err);
                    continue;
                }
            };
            let Some(source_title) = non_empty(row.ch_name) else {
                continue;
            };
            let Some(canonical_id) = non_empty(row.mal_id).and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };
            entries.insert(
                source_title,
                IdentityCacheEntry {
                    canonical_id,
                    canonical_title: non_empty(row.mal_title),
                    image_url: non_empty(row.img_url),
                },
            );
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, source_title: &str) -> Option<&IdentityCacheEntry> {
        self.entries.get(source_title.trim())
    }

    /// Resolves a cache hit. Title defaults to the source title, image to the placeholder.
    pub fn lookup(&self, source_title: &str) -> Option<ResolvedIdentity> {
        let key = source_title.trim();
        let entry = self.entries.get(key)?;
        Some(ResolvedIdentity {
            canonical_id: entry.canonical_id,
            canonical_title: entry
                .canonical_title
                .clone()
                .unwrap_or_else(|| key.to_string()),
            image_url: entry
                .image_url
                .clone()
                .unwrap_or_else(|| PLACEHOLDER_IMAGE_URL.to_string()),
            tier: ConfidenceTier::CacheHit,
            date_diff_days: None,
        })
    }

    /// Canonical ids of every entry, deduplicated, in ascending order.
    pub fn canonical_ids(&self) -> Vec<(u64, String)> {
        let mut ids: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|(title, entry)| (entry.canonical_id, title.clone()))
            .collect();
        ids.sort_unstable();
        ids.dedup_by_key(|(id, _)| *id);
        ids
    }

    /// Appends reviewed candidates to the cache file at `path`.
    ///
    /// Rows marked excluded and titles already present (in the file or earlier
    /// in `candidates`) are skipped. The header is written when the file is new.
    pub fn merge_into_file(
        path: &Path,
        candidates: &[CandidateRow],
    ) -> Result<MergeSummary, CacheError> {
        let existing_keys: HashSet<String> = if path.exists() {
            Self::from_csv_str(&read_without_bom(path)?)?
                .entries
                .into_keys()
                .collect()
        } else {
            HashSet::new()
        };
        let mut known = existing_keys;
        let mut summary = MergeSummary::default();
        let mut additions = Vec::new();

        for candidate in candidates {
            let source_title = candidate.source_title.trim();
            if candidate.check_mark.trim().eq_ignore_ascii_case(EXCLUDE_MARK) {
                summary.excluded += 1;
                continue;
            }
            if source_title.is_empty() || known.contains(source_title) {
                summary.duplicates += 1;
                continue;
            }
            known.insert(source_title.to_string());
            additions.push([
                source_title.to_string(),
                candidate.canonical_id.trim().to_string(),
                candidate.canonical_title.trim().to_string(),
                candidate.image_url.trim().to_string(),
            ]);
        }

        if additions.is_empty() {
            return Ok(summary);
        }

        let write_header = fs::metadata(path).map_or(true, |meta| meta.len() == 0);
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| CacheError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let io_error = |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_error)?;
        if !write_header && !ends_with_newline(path).map_err(io_error)? {
            file.write_all(b"\n").map_err(io_error)?;
        }
        let mut writer = csv::Writer::from_writer(file);
        if write_header {
            writer.write_record(IDENTITY_CACHE_HEADER)?;
        }
        for row in &additions {
            writer.write_record(row)?;
        }
        writer.flush().map_err(io_error)?;
        summary.added = additions.len();
        info!(
            "Identity cache merge into {}: added={} duplicates={} excluded={}",
            path.display(),
            summary.added,
            summary.duplicates,
            summary.excluded
        );
        Ok(summary)
    }

    /// Reads a candidate review sheet exported as CSV.
    ///
    /// Columns: time, source title, canonical id, canonical title, image url,
    /// preview, status, check mark. Rows with fewer than five columns are ignored.
    pub fn read_candidate_rows(path: &Path) -> Result<Vec<CandidateRow>, CacheError> {
        let content = read_without_bom(path)?;
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(true)
            .from_reader(content.as_bytes());
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            if record.len() < 5 {
                continue;
            }
            let column = |index: usize| record.get(index).unwrap_or_default().trim().to_string();
            rows.push(CandidateRow {
                source_title: column(1),
                canonical_id: column(2),
                canonical_title: column(3),
                image_url: column(4),
                check_mark: column(7),
            });
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::{CandidateRow, IdentityCache};
    use crate::protocol::{ConfidenceTier, PLACEHOLDER_IMAGE_URL};

    const SAMPLE_CSV: &str = "\u{feff}ch_name,mal_id,mal_title,img_url\n\
範例動畫,5114,Sample Show,https://img.example.test/5114.jpg\n\
無圖動畫,9253,,\n\
壞資料,not-a-number,Broken,\n\
,1,Nameless,\n";

    fn candidate(title: &str, id: &str, mark: &str) -> CandidateRow {
        CandidateRow {
            source_title: title.to_string(),
            canonical_id: id.to_string(),
            canonical_title: format!("Title {id}"),
            image_url: String::new(),
            check_mark: mark.to_string(),
        }
    }

    #[test]
    fn test_from_csv_str_skips_rows_without_title_or_numeric_id() {
        let content = SAMPLE_CSV.trim_start_matches('\u{feff}');
        let cache = IdentityCache::from_csv_str(content).expect("csv should parse");
        assert_eq!(cache.len(), 2);
        assert!(cache.get("壞資料").is_none());
    }

    #[test]
    fn test_lookup_defaults_title_and_placeholder_image() {
        let cache = IdentityCache::from_csv_str(SAMPLE_CSV.trim_start_matches('\u{feff}'))
            .expect("csv should parse");
        let resolved = cache.lookup("無圖動畫").expect("cache hit");

        assert_eq!(resolved.canonical_id, 9253);
        assert_eq!(resolved.canonical_title, "無圖動畫");
        assert_eq!(resolved.image_url, PLACEHOLDER_IMAGE_URL);
        assert_eq!(resolved.tier, ConfidenceTier::CacheHit);
    }

    #[test]
    fn test_lookup_key_is_trimmed_but_not_normalized() {
        let cache = IdentityCache::from_csv_str(SAMPLE_CSV.trim_start_matches('\u{feff}'))
            .expect("csv should parse");
        assert!(cache.lookup("  範例動畫 ").is_some());
        assert!(cache.lookup("範例动画").is_none());
    }

    #[test]
    fn test_lookup_is_idempotent() {
        let cache = IdentityCache::from_csv_str(SAMPLE_CSV.trim_start_matches('\u{feff}'))
            .expect("csv should parse");
        assert_eq!(cache.lookup("範例動畫"), cache.lookup("範例動畫"));
    }

    #[test]
    fn test_load_tolerates_bom_and_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mal_id.csv");
        assert!(IdentityCache::load(&path).is_empty());

        std::fs::write(&path, SAMPLE_CSV).expect("write cache");
        let cache = IdentityCache::load(&path);
        assert_eq!(
            cache.lookup("範例動畫").map(|hit| hit.canonical_title),
            Some("Sample Show".to_string())
        );
    }

    #[test]
    fn test_load_accepts_legacy_three_column_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mal_id.csv");
        std::fs::write(
            &path,
            "ch_name,mal_id,img_url\n舊資料,42,https://img.example.test/42.jpg\n",
        )
        .expect("write cache");

        let hit = IdentityCache::load(&path).lookup("舊資料").expect("cache hit");
        assert_eq!(hit.canonical_id, 42);
        assert_eq!(hit.canonical_title, "舊資料");
        assert_eq!(hit.image_url, "https://img.example.test/42.jpg");
    }

    #[test]
    fn test_merge_into_file_skips_duplicates_and_excluded_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mal_id.csv");
        std::fs::write(&path, SAMPLE_CSV).expect("write cache");

        let summary = IdentityCache::merge_into_file(
            &path,
            &[
                candidate("範例動畫", "5114", ""),
                candidate("新動畫", "777", ""),
                candidate("新動畫", "778", ""),
                candidate("排除動畫", "888", "x"),
            ],
        )
        .expect("merge should succeed");

        assert_eq!(summary.added, 1);
        assert_eq!(summary.duplicates, 2);
        assert_eq!(summary.excluded, 1);
        let reloaded = IdentityCache::load(&path);
        assert_eq!(reloaded.lookup("新動畫").map(|hit| hit.canonical_id), Some(777));
        assert!(reloaded.lookup("排除動畫").is_none());
    }

    #[test]
    fn test_merge_into_file_appends_after_unterminated_last_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mal_id.csv");
        std::fs::write(&path, "ch_name,mal_id,mal_title,img_url\n舊動畫,1,Old Show,")
            .expect("write cache");

        IdentityCache::merge_into_file(&path, &[candidate("新動畫", "2", "")])
            .expect("merge should succeed");

        let reloaded = IdentityCache::load(&path);
        assert_eq!(reloaded.len(), 2);
        let old = reloaded.get("舊動畫").expect("old row kept");
        assert_eq!(old.canonical_id, 1);
        assert_eq!(old.image_url, None);
        assert_eq!(reloaded.get("新動畫").map(|entry| entry.canonical_id), Some(2));
    }

    #[test]
    fn test_merge_into_new_file_writes_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fresh.csv");

        IdentityCache::merge_into_file(&path, &[candidate("新動畫", "777", "")])
            .expect("merge should succeed");

        let content = std::fs::read_to_string(&path).expect("read cache");
        assert!(content.starts_with("ch_name,mal_id,mal_title,img_url"));
        assert_eq!(IdentityCache::load(&path).len(), 1);
    }
}
