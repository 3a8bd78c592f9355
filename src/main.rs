use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bahalist::acquisition::AcquisitionPipeline;
use bahalist::asset_cache::AssetIndexCache;
use bahalist::backends::animethemes::AnimeThemesIndex;
use bahalist::backends::bahamut::BahamutCatalog;
use bahalist::backends::http::HttpMediaFetcher;
use bahalist::backends::jikan::JikanSearch;
use bahalist::catalog::CatalogGateway;
use bahalist::config::{default_config_path, load_or_create, Config, LoggingConfig};
use bahalist::export;
use bahalist::identity_cache::IdentityCache;
use bahalist::protocol::{AcquisitionTarget, ProgressEvent, ResolvedIdentity, ResolvedRow};
use bahalist::resolver::Resolver;
use clap::{Parser, Subcommand};
use log::{info, warn};

#[derive(Parser, Debug)]
#[clap(name = "bahalist")]
#[clap(about = "Resolve a Bahamut anime collection against MyAnimeList and fetch theme songs")]
struct Args {
    /// Config file (defaults to the user config directory)
    #[clap(long, value_name = "FILE", env = "BAHALIST_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level regardless of the config
    #[clap(long, short)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a user's collection and print one JSON row per entry
    Resolve {
        user_id: String,
        /// Only process the first N listed entries
        #[clap(long)]
        limit: Option<usize>,
    },
    /// Resolve a user's collection and write a MyAnimeList import document
    Export {
        user_id: String,
        #[clap(long)]
        limit: Option<usize>,
        /// Also include low-confidence matches
        #[clap(long)]
        include_low: bool,
    },
    /// Resolve a user's collection and download its theme songs into one archive
    Themes {
        user_id: String,
        #[clap(long)]
        limit: Option<usize>,
        #[clap(long)]
        include_low: bool,
    },
    /// Fill the theme index for every identity-cache entry
    SyncThemes,
    /// Append reviewed candidate rows to the identity cache
    MergeCache {
        #[clap(value_name = "CSV")]
        candidates: PathBuf,
    },
}

struct Services {
    config: Config,
    identity_cache: Arc<IdentityCache>,
    asset_cache: Arc<AssetIndexCache>,
}

impl Services {
    fn open(config: Config) -> Self {
        let identity_cache = Arc::new(IdentityCache::load(&config.cache.identity_cache_path));
        let media_index = Arc::new(AnimeThemesIndex::new(
            &config.endpoints,
            &config.http,
            &config.resolver,
        ));
        let asset_cache = Arc::new(AssetIndexCache::open(
            &config.cache.asset_index_path,
            media_index,
        ));
        Self {
            config,
            identity_cache,
            asset_cache,
        }
    }

    /// Lists, fetches details, and resolves a user's collection.
    fn resolve_user(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> (Vec<ResolvedRow>, Vec<Option<ResolvedIdentity>>) {
        let config = &self.config;
        let gateway = CatalogGateway::new(
            Arc::new(BahamutCatalog::new(
                &config.endpoints,
                &config.http,
                &config.catalog,
            )),
            &config.catalog,
        );
        let mut listing = gateway.list_collection_ids(user_id);
        if let Some(limit) = limit {
            listing.entries.truncate(limit);
        }
        let details = gateway.fetch_all_details(&listing.entries);

        let resolver = Resolver::new(
            self.identity_cache.clone(),
            self.asset_cache.clone(),
            Arc::new(JikanSearch::new(
                &config.endpoints,
                &config.http,
                &config.resolver,
            )),
            &config.resolver,
        );
        let (rows, identities, _) = resolver.resolve_batch(&details.records, |progress| {
            info!(
                "Resolve[{}/{}]: {} -> {}",
                progress.completed,
                progress.total,
                progress.row.source_title,
                progress.row.status
            );
        });
        (rows, identities)
    }
}

fn selected_targets(
    rows: &[ResolvedRow],
    identities: &[Option<ResolvedIdentity>],
    include_low: bool,
) -> Vec<AcquisitionTarget> {
    rows.iter()
        .zip(identities)
        .filter(|(row, _)| include_low || !row.is_low)
        .filter_map(|(_, identity)| identity.as_ref().map(AcquisitionTarget::from))
        .collect()
}

fn run(command: Command, services: &Services) -> Result<(), Box<dyn std::error::Error>> {
    let config = &services.config;
    match command {
        Command::Resolve { user_id, limit } => {
            let (rows, _) = services.resolve_user(&user_id, limit);
            for row in rows {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Command::Export {
            user_id,
            limit,
            include_low,
        } => {
            let (rows, identities) = services.resolve_user(&user_id, limit);
            let targets = selected_targets(&rows, &identities, include_low);
            let document = export::serialize(&targets, &user_id)?;
            let path = export::save(&document, &config.acquisition.output_dir, &user_id)?;
            println!("{}", path.display());
        }
        Command::Themes {
            user_id,
            limit,
            include_low,
        } => {
            let (rows, identities) = services.resolve_user(&user_id, limit);
            let targets = selected_targets(&rows, &identities, include_low);
            let pipeline = AcquisitionPipeline::new(
                services.asset_cache.clone(),
                Arc::new(HttpMediaFetcher::new(
                    config.http.connect_timeout(),
                    config.http.download_timeout(),
                    &config.endpoints.user_agent,
                )),
                config.acquisition.clone(),
            );
            let file_name = format!(
                "{}_themes_{}.zip",
                user_id,
                chrono::Local::now().format("%Y%m%d%H%M%S")
            );
            let output_path = config.acquisition.output_dir.join(file_name);
            for event in pipeline.acquire(targets, output_path) {
                println!("{}", serde_json::to_string(&event)?);
                if let ProgressEvent::Failed { error, .. } = event {
                    return Err(error.into());
                }
            }
        }
        Command::SyncThemes => {
            let identities = services.identity_cache.canonical_ids();
            let report = services.asset_cache.warm(
                &identities,
                Duration::from_millis(config.acquisition.warm_delay_ms),
            );
            println!("{}", serde_json::to_string(&report)?);
        }
        Command::MergeCache { candidates } => {
            let rows = IdentityCache::read_candidate_rows(&candidates)?;
            let summary =
                IdentityCache::merge_into_file(&config.cache.identity_cache_path, &rows)?;
            println!(
                "added={} duplicates={} excluded={}",
                summary.added, summary.duplicates, summary.excluded
            );
        }
    }
    Ok(())
}

/// `--verbose` wins; otherwise the config level once it is loaded, `Info` before that.
fn log_level(verbose: bool, logging: Option<&LoggingConfig>) -> log::LevelFilter {
    if verbose {
        return log::LevelFilter::Debug;
    }
    logging.map_or(log::LevelFilter::Info, LoggingConfig::level_filter)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // The global max level gates output; the builder passes everything through.
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Trace);
    clog.init();
    log::set_max_level(log_level(args.verbose, None));

    let config_path = args
        .config
        .clone()
        .or_else(default_config_path)
        .ok_or("no config directory available; pass --config")?;
    let config = load_or_create(&config_path)?;
    log::set_max_level(log_level(args.verbose, Some(&config.logging)));

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    info!("Using config {}", config_path.display());
    let services = Services::open(config);
    if services.identity_cache.is_empty() {
        warn!("Identity cache is empty; every title goes through search");
    }
    run(args.command, &services)
}
