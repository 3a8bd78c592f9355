//! Process-wide canonical-id to theme-link index, persisted as JSON.
//!
//! One instance is constructed at startup and shared by handle between the
//! resolver and the acquisition pipeline. Each id is queried upstream at most
//! once: concurrent callers for the same id wait for the in-flight lookup,
//! and every stored result (including an empty one) is written to disk before
//! the lookup returns.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::backends::MediaIndex;
use crate::error::{CacheError, UpstreamError};
use crate::protocol::{BatchReport, ItemOutcome, MediaLink};

#[derive(Debug, Default)]
struct AssetState {
    entries: BTreeMap<u64, Vec<MediaLink>>,
    in_flight: HashSet<u64>,
}

/// Shared theme-link cache. Cheap to share via `Arc`.
pub struct AssetIndexCache {
    path: PathBuf,
    index: Arc<dyn MediaIndex>,
    state: Mutex<AssetState>,
    lookup_finished: Condvar,
    external_queries: AtomicUsize,
}

fn load_entries(path: &Path) -> Result<BTreeMap<u64, Vec<MediaLink>>, CacheError> {
    let content = fs::read_to_string(path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: BTreeMap<String, Vec<MediaLink>> =
        serde_json::from_str(&content).map_err(|err| CacheError::Corrupt {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
    let mut entries = BTreeMap::new();
    for (key, links) in raw {
        match key.trim().parse::<u64>() {
            Ok(canonical_id) => {
                entries.insert(canonical_id, links);
            }
            Err(_) => warn!("Themes[cache]: ignoring non-numeric key '{}'", key),
        }
    }
    Ok(entries)
}

fn persist_entries(path: &Path, entries: &BTreeMap<u64, Vec<MediaLink>>) -> Result<(), CacheError> {
    let rendered = serde_json::to_string_pretty(entries)?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| CacheError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let staging_path = path.with_extension("json.tmp");
    fs::write(&staging_path, rendered).map_err(|source| CacheError::Io {
        path: staging_path.clone(),
        source,
    })?;
    fs::rename(&staging_path, path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl AssetIndexCache {
    /// Loads the persisted map once. A missing or corrupt file yields a cold cache.
    pub fn open(path: &Path, index: Arc<dyn MediaIndex>) -> Self {
        let entries = if path.exists() {
            match load_entries(path) {
                Ok(entries) => {
                    info!(
                        "Themes[cache]: loaded {} entries from {}",
                        entries.len(),
                        path.display()
                    );
                    entries
                }
                Err(err) => {
                    warn!("Themes[cache]: starting cold, {}", err);
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        Self {
            path: path.to_path_buf(),
            index,
            state: Mutex::new(AssetState {
                entries,
                in_flight: HashSet::new(),
            }),
            lookup_finished: Condvar::new(),
            external_queries: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("asset cache lock poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, canonical_id: u64) -> bool {
        self.state
            .lock()
            .expect("asset cache lock poisoned")
            .entries
            .contains_key(&canonical_id)
    }

    /// Upstream lookups issued by this instance.
    pub fn external_queries(&self) -> usize {
        self.external_queries.load(Ordering::SeqCst)
    }

    /// Returns the theme links for `canonical_id`, querying upstream on first use.
    ///
    /// A failed lookup (including rate-limit exhaustion) is cached as an empty
    /// list, so each id reaches upstream at most once.
    pub fn get_assets(&self, canonical_id: u64) -> Vec<MediaLink> {
        self.lookup(canonical_id).0
    }

    /// Like [`Self::get_assets`], also returning the upstream error when this
    /// call performed a lookup that failed.
    fn lookup(&self, canonical_id: u64) -> (Vec<MediaLink>, Option<UpstreamError>) {
        let mut state = self.state.lock().expect("asset cache lock poisoned");
        loop {
            if let Some(links) = state.entries.get(&canonical_id) {
                return (links.clone(), None);
            }
            if !state.in_flight.contains(&canonical_id) {
                break;
            }
            state = self
                .lookup_finished
                .wait(state)
                .expect("asset cache lock poisoned");
        }
        state.in_flight.insert(canonical_id);
        drop(state);

        self.external_queries.fetch_add(1, Ordering::SeqCst);
        let (links, failure) = match self.index.fetch_themes(canonical_id) {
            Ok(links) => (links, None),
            Err(err) => {
                warn!(
                    "Themes[{}]: lookup failed, caching empty result: {}",
                    canonical_id, err
                );
                (Vec::new(), Some(err))
            }
        };

        let mut state = self.state.lock().expect("asset cache lock poisoned");
        state.in_flight.remove(&canonical_id);
        state.entries.insert(canonical_id, links.clone());
        if let Err(err) = persist_entries(&self.path, &state.entries) {
            warn!("Themes[cache]: persist failed: {}", err);
        }
        debug!(
            "Themes[{}]: cached {} link(s)",
            canonical_id,
            links.len()
        );
        drop(state);
        self.lookup_finished.notify_all();

        (links, failure)
    }

    /// Populates entries for every id not yet cached, pausing `delay` between lookups.
    pub fn warm(&self, identities: &[(u64, String)], delay: Duration) -> BatchReport {
        let mut report = BatchReport::default();
        let total = identities.len();
        for (position, (canonical_id, label)) in identities.iter().enumerate() {
            if self.contains(*canonical_id) {
                debug!(
                    "Themes[warm]: [{}/{}] skipped (cached): {}",
                    position + 1,
                    total,
                    label
                );
                report.record(label.clone(), ItemOutcome::Skipped);
                continue;
            }

            match self.lookup(*canonical_id) {
                (links, None) => {
                    info!(
                        "Themes[warm]: [{}/{}] {} -> {} theme(s)",
                        position + 1,
                        total,
                        label,
                        links.len()
                    );
                    report.record(label.clone(), ItemOutcome::Succeeded);
                }
                (_, Some(err)) => {
                    report.record(label.clone(), ItemOutcome::Failed(err.to_string()));
                }
            }
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
        info!(
            "Themes[warm]: new={} skipped={} failed={}",
            report.succeeded,
            report.skipped,
            report.failed.len()
        );
        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::AssetIndexCache;
    use crate::backends::MediaIndex;
    use crate::error::UpstreamError;
    use crate::protocol::MediaLink;
    use crate::worker_pool::run_bounded;

    /// In-memory media index that counts lookups per id.
    #[derive(Default)]
    pub(crate) struct FakeMediaIndex {
        pub themes: HashMap<u64, Result<Vec<MediaLink>, UpstreamError>>,
        pub calls: Mutex<HashMap<u64, usize>>,
        pub total_calls: AtomicUsize,
        pub delay: Duration,
    }

    impl FakeMediaIndex {
        pub(crate) fn with_themes(themes: Vec<(u64, Vec<MediaLink>)>) -> Self {
            Self {
                themes: themes
                    .into_iter()
                    .map(|(id, links)| (id, Ok(links)))
                    .collect(),
                ..Self::default()
            }
        }

        pub(crate) fn calls_for(&self, canonical_id: u64) -> usize {
            self.calls
                .lock()
                .expect("calls lock")
                .get(&canonical_id)
                .copied()
                .unwrap_or(0)
        }
    }

    impl MediaIndex for FakeMediaIndex {
        fn fetch_themes(&self, canonical_id: u64) -> Result<Vec<MediaLink>, UpstreamError> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            *self
                .calls
                .lock()
                .expect("calls lock")
                .entry(canonical_id)
                .or_insert(0) += 1;
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.themes
                .get(&canonical_id)
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    pub(crate) fn link(theme_type: &str, title: &str) -> MediaLink {
        MediaLink {
            theme_type: theme_type.to_string(),
            song_title: title.to_string(),
            source_url: format!("https://a.animethemes.moe/Show-{theme_type}.ogg"),
        }
    }

    #[test]
    fn test_get_assets_queries_each_id_at_most_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = Arc::new(FakeMediaIndex::with_themes(vec![(1, vec![link("OP1", "Song")])]));
        let cache = AssetIndexCache::open(&dir.path().join("theme_cache.json"), index.clone());

        for _ in 0..5 {
            assert_eq!(cache.get_assets(1).len(), 1);
        }
        assert_eq!(index.calls_for(1), 1);
        assert_eq!(cache.external_queries(), 1);
    }

    #[test]
    fn test_empty_result_is_cached_and_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("theme_cache.json");
        let index = Arc::new(FakeMediaIndex::default());
        let cache = AssetIndexCache::open(&path, index.clone());

        assert!(cache.get_assets(404).is_empty());
        assert!(cache.get_assets(404).is_empty());
        assert_eq!(index.calls_for(404), 1);

        let reopened_index = Arc::new(FakeMediaIndex::default());
        let reopened = AssetIndexCache::open(&path, reopened_index.clone());
        assert!(reopened.contains(404));
        assert!(reopened.get_assets(404).is_empty());
        assert_eq!(reopened_index.calls_for(404), 0);
    }

    #[test]
    fn test_rate_limit_exhaustion_caches_negative_result() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut fake = FakeMediaIndex::default();
        fake.themes
            .insert(7, Err(UpstreamError::RateLimited { attempts: 4 }));
        let index = Arc::new(fake);
        let cache = AssetIndexCache::open(&dir.path().join("theme_cache.json"), index.clone());

        assert!(cache.get_assets(7).is_empty());
        assert!(cache.get_assets(7).is_empty());
        assert_eq!(index.calls_for(7), 1);
    }

    #[test]
    fn test_server_error_is_cached_as_empty_result() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("theme_cache.json");
        let mut fake = FakeMediaIndex::default();
        fake.themes.insert(9, Err(UpstreamError::Status(503)));
        fake.themes
            .insert(10, Err(UpstreamError::Transport("reset".to_string())));
        let index = Arc::new(fake);
        let cache = AssetIndexCache::open(&path, index.clone());

        for _ in 0..5 {
            assert!(cache.get_assets(9).is_empty());
            assert!(cache.get_assets(10).is_empty());
        }
        assert_eq!(index.calls_for(9), 1);
        assert_eq!(index.calls_for(10), 1);

        let persisted: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read cache"))
                .expect("valid json");
        assert_eq!(persisted["9"], serde_json::json!([]));
    }

    #[test]
    fn test_warm_reports_failed_lookup_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut fake = FakeMediaIndex::default();
        fake.themes.insert(4, Err(UpstreamError::Status(500)));
        let index = Arc::new(fake);
        let cache = AssetIndexCache::open(&dir.path().join("theme_cache.json"), index.clone());

        let first = cache.warm(&[(4, "Four".to_string())], Duration::ZERO);
        let second = cache.warm(&[(4, "Four".to_string())], Duration::ZERO);

        assert_eq!(first.failed.len(), 1);
        assert_eq!(second.skipped, 1);
        assert_eq!(index.calls_for(4), 1);
    }

    #[test]
    fn test_concurrent_callers_share_one_lookup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut fake = FakeMediaIndex::with_themes(vec![(3, vec![link("ED1", "Ending")])]);
        fake.delay = Duration::from_millis(30);
        let index = Arc::new(fake);
        let cache = AssetIndexCache::open(&dir.path().join("theme_cache.json"), index.clone());

        let mut sizes = Vec::new();
        run_bounded(
            vec![3u64; 8],
            8,
            |id| cache.get_assets(id).len(),
            |_, size| sizes.push(size),
        );

        assert_eq!(sizes, vec![1; 8]);
        assert_eq!(index.calls_for(3), 1);
    }

    #[test]
    fn test_corrupt_file_degrades_to_cold_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("theme_cache.json");
        std::fs::write(&path, "{ not json").expect("write corrupt cache");

        let cache = AssetIndexCache::open(&path, Arc::new(FakeMediaIndex::default()));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_persisted_file_uses_type_title_link_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("theme_cache.json");
        let index = Arc::new(FakeMediaIndex::with_themes(vec![(5, vec![link("OP1", "Song")])]));
        let cache = AssetIndexCache::open(&path, index);
        cache.get_assets(5);

        let persisted: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read cache"))
                .expect("valid json");
        assert_eq!(persisted["5"][0]["type"], "OP1");
        assert_eq!(persisted["5"][0]["title"], "Song");
        assert_eq!(
            persisted["5"][0]["link"],
            "https://a.animethemes.moe/Show-OP1.ogg"
        );
    }

    #[test]
    fn test_warm_skips_cached_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = Arc::new(FakeMediaIndex::with_themes(vec![(1, vec![link("OP1", "Song")])]));
        let cache = AssetIndexCache::open(&dir.path().join("theme_cache.json"), index.clone());
        cache.get_assets(1);

        let report = cache.warm(
            &[(1, "One".to_string()), (2, "Two".to_string())],
            Duration::ZERO,
        );

        assert_eq!(report.skipped, 1);
        assert_eq!(report.succeeded, 1);
        assert!(report.failed.is_empty());
        assert_eq!(index.total_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
