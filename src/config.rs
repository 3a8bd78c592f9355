//! Persistent application configuration model, defaults, and loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};

use crate::error::ConfigError;

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Upstream endpoint locations.
    pub endpoints: EndpointsConfig,
    #[serde(default)]
    /// Per-family outbound timeouts.
    pub http: HttpConfig,
    #[serde(default)]
    /// Source catalog listing and detail preferences.
    pub catalog: CatalogConfig,
    #[serde(default)]
    /// Candidate search and classification tuning.
    pub resolver: ResolverConfig,
    #[serde(default)]
    /// Theme download pipeline tuning.
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    /// Cache file locations.
    pub cache: CacheConfig,
    #[serde(default)]
    /// Log verbosity.
    pub logging: LoggingConfig,
}

/// Base URLs of every consumed API.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct EndpointsConfig {
    #[serde(default = "default_collection_url")]
    pub collection_url: String,
    #[serde(default = "default_detail_url")]
    pub detail_url: String,
    #[serde(default = "default_search_url")]
    pub search_url: String,
    #[serde(default = "default_media_index_url")]
    pub media_index_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Outbound call timeouts, in seconds. Every call carries its own timeout.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_catalog_timeout_secs")]
    pub catalog_timeout_secs: u64,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    #[serde(default = "default_media_index_timeout_secs")]
    pub media_index_timeout_secs: u64,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

/// Source catalog listing preferences.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct CatalogConfig {
    /// Worker count used while fetching per-entry details.
    #[serde(default = "default_detail_workers")]
    pub detail_workers: usize,
    /// Rating tiers queried as independent listing shards.
    #[serde(default = "default_rating_shards")]
    pub rating_shards: Vec<String>,
    /// Listing category filter sent with every page request.
    #[serde(default = "default_listing_category")]
    pub listing_category: u32,
    /// Detail category tag an entry must carry to be kept.
    #[serde(default = "default_detail_category")]
    pub detail_category: String,
}

/// Candidate search and classification tuning.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct ResolverConfig {
    #[serde(default = "default_search_limit")]
    pub search_limit: u32,
    /// Fixed delay enforced between consecutive search calls.
    #[serde(default = "default_search_delay_ms")]
    pub search_delay_ms: u64,
    /// Maximum air-date distance for a candidate to count as date-confirmed.
    #[serde(default = "default_date_window_days")]
    pub date_window_days: i64,
    #[serde(default = "default_max_rate_limit_attempts")]
    pub max_rate_limit_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_ceiling_ms")]
    pub backoff_ceiling_ms: u64,
    /// Worker count used by batch resolution.
    #[serde(default = "default_resolve_workers")]
    pub resolve_workers: usize,
}

/// Theme download pipeline tuning.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AcquisitionConfig {
    #[serde(default = "default_metadata_workers")]
    pub metadata_workers: usize,
    #[serde(default = "default_download_workers")]
    pub download_workers: usize,
    /// Capacity of the progress channel handed to the consumer.
    #[serde(default = "default_progress_buffer")]
    pub progress_buffer: usize,
    /// Parent directory for scratch download folders. System temp when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    /// Folder receiving finished archives and import documents.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Pause between uncached lookups while warming the asset index.
    #[serde(default = "default_warm_delay_ms")]
    pub warm_delay_ms: u64,
}

/// Cache file locations.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_identity_cache_path")]
    pub identity_cache_path: PathBuf,
    #[serde(default = "default_asset_index_path")]
    pub asset_index_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            collection_url: default_collection_url(),
            detail_url: default_detail_url(),
            search_url: default_search_url(),
            media_index_url: default_media_index_url(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            catalog_timeout_secs: default_catalog_timeout_secs(),
            search_timeout_secs: default_search_timeout_secs(),
            media_index_timeout_secs: default_media_index_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            detail_workers: default_detail_workers(),
            rating_shards: default_rating_shards(),
            listing_category: default_listing_category(),
            detail_category: default_detail_category(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            search_limit: default_search_limit(),
            search_delay_ms: default_search_delay_ms(),
            date_window_days: default_date_window_days(),
            max_rate_limit_attempts: default_max_rate_limit_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_ceiling_ms: default_backoff_ceiling_ms(),
            resolve_workers: default_resolve_workers(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            metadata_workers: default_metadata_workers(),
            download_workers: default_download_workers(),
            progress_buffer: default_progress_buffer(),
            work_dir: None,
            output_dir: default_output_dir(),
            warm_delay_ms: default_warm_delay_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            identity_cache_path: default_identity_cache_path(),
            asset_index_path: default_asset_index_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_secs(self.catalog_timeout_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    pub fn media_index_timeout(&self) -> Duration {
        Duration::from_secs(self.media_index_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl LoggingConfig {
    /// Parses the configured level, falling back to `Info` for unknown names.
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level
            .trim()
            .parse::<log::LevelFilter>()
            .unwrap_or(log::LevelFilter::Info)
    }
}

fn default_collection_url() -> String {
    "https://wall.gamer.com.tw/api/user_join_fanpage.php".to_string()
}

fn default_detail_url() -> String {
    "https://api.gamer.com.tw/acg/v1/acg_list.php".to_string()
}

fn default_search_url() -> String {
    "https://api.jikan.moe/v4/anime".to_string()
}

fn default_media_index_url() -> String {
    "https://api.animethemes.moe/anime".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_catalog_timeout_secs() -> u64 {
    15
}

fn default_search_timeout_secs() -> u64 {
    10
}

fn default_media_index_timeout_secs() -> u64 {
    15
}

fn default_download_timeout_secs() -> u64 {
    30
}

fn default_detail_workers() -> usize {
    8
}

fn default_rating_shards() -> Vec<String> {
    (1..=5).map(|star| format!("S{star}")).collect()
}

fn default_listing_category() -> u32 {
    4
}

fn default_detail_category() -> String {
    "動畫".to_string()
}

fn default_search_limit() -> u32 {
    5
}

fn default_search_delay_ms() -> u64 {
    700
}

fn default_date_window_days() -> i64 {
    30
}

fn default_max_rate_limit_attempts() -> u32 {
    4
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_ceiling_ms() -> u64 {
    16_000
}

fn default_resolve_workers() -> usize {
    4
}

fn default_metadata_workers() -> usize {
    6
}

fn default_download_workers() -> usize {
    6
}

fn default_progress_buffer() -> usize {
    64
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_warm_delay_ms() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn bahalist_cache_root() -> PathBuf {
    dirs::cache_dir()
        .map(|path| path.join("bahalist"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_identity_cache_path() -> PathBuf {
    bahalist_cache_root().join("mal_id.csv")
}

fn default_asset_index_path() -> PathBuf {
    bahalist_cache_root().join("theme_cache.json")
}

/// Default location of `config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|path| path.join("bahalist").join("config.toml"))
}

/// Clamps tuning values into ranges the pipeline can run with.
pub fn sanitize_config(config: Config) -> Config {
    let clamp_secs = |value: u64| value.clamp(1, 120);
    let clamp_workers = |value: usize| value.clamp(1, 16);

    Config {
        http: HttpConfig {
            connect_timeout_secs: clamp_secs(config.http.connect_timeout_secs),
            catalog_timeout_secs: clamp_secs(config.http.catalog_timeout_secs),
            search_timeout_secs: clamp_secs(config.http.search_timeout_secs),
            media_index_timeout_secs: clamp_secs(config.http.media_index_timeout_secs),
            download_timeout_secs: clamp_secs(config.http.download_timeout_secs),
        },
        catalog: CatalogConfig {
            detail_workers: clamp_workers(config.catalog.detail_workers),
            rating_shards: if config.catalog.rating_shards.is_empty() {
                default_rating_shards()
            } else {
                config.catalog.rating_shards
            },
            ..config.catalog
        },
        resolver: ResolverConfig {
            search_limit: config.resolver.search_limit.clamp(1, 25),
            date_window_days: config.resolver.date_window_days.max(0),
            max_rate_limit_attempts: config.resolver.max_rate_limit_attempts.clamp(1, 8),
            backoff_ceiling_ms: config
                .resolver
                .backoff_ceiling_ms
                .max(config.resolver.backoff_base_ms),
            resolve_workers: clamp_workers(config.resolver.resolve_workers),
            ..config.resolver
        },
        acquisition: AcquisitionConfig {
            metadata_workers: clamp_workers(config.acquisition.metadata_workers),
            download_workers: clamp_workers(config.acquisition.download_workers),
            progress_buffer: config.acquisition.progress_buffer.max(1),
            ..config.acquisition
        },
        ..config
    }
}

/// Reads the config at `path`, writing a default file first when none exists.
pub fn load_or_create(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let rendered = toml::to_string(&Config::default())?;
        std::fs::write(path, rendered).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed = toml::from_str::<Config>(&content).unwrap_or_else(|err| {
        warn!(
            "Config file {} is invalid, using defaults: {}",
            path.display(),
            err
        );
        Config::default()
    });
    Ok(sanitize_config(parsed))
}
