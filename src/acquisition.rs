//! Theme-song acquisition: media lookup fan-out, parallel downloads, archive assembly.
//!
//! `acquire` returns immediately with a [`ProgressStream`]; a coordinator thread
//! drives the stages and pushes [`ProgressEvent`]s through a bounded channel.
//! The stream always ends with `Finished` or `Failed`.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::asset_cache::AssetIndexCache;
use crate::backends::MediaFetcher;
use crate::config::AcquisitionConfig;
use crate::error::AcquireError;
use crate::media_file_discovery::{
    collect_files_for_archive, extension_from_link, sanitize_component, unique_file_name,
};
use crate::protocol::{
    AcquisitionResult, AcquisitionTarget, BatchReport, ItemOutcome, MediaLink, ProgressEvent,
};
use crate::worker_pool::run_bounded;

const SEARCH_PROGRESS_END: u8 = 20;
const DOWNLOAD_PROGRESS_END: u8 = 90;
const PACKAGING_PROGRESS: u8 = 95;
const DONE_PROGRESS: u8 = 100;

fn stage_progress(start: u8, end: u8, completed: usize, total: usize) -> u8 {
    if total == 0 {
        return end;
    }
    let span = usize::from(end.saturating_sub(start));
    let offset = span * completed.min(total) / total;
    start.saturating_add(u8::try_from(offset).unwrap_or(u8::MAX))
}

/// Blocking iterator over one acquisition run's progress events.
pub struct ProgressStream {
    receiver: mpsc::Receiver<ProgressEvent>,
    coordinator: Option<JoinHandle<()>>,
    terminated: bool,
}

impl ProgressStream {
    fn join_coordinator(&mut self) {
        if let Some(handle) = self.coordinator.take() {
            if handle.join().is_err() {
                error!("Acquire[coordinator]: thread panicked");
            }
        }
    }
}

impl Iterator for ProgressStream {
    type Item = ProgressEvent;

    fn next(&mut self) -> Option<ProgressEvent> {
        if self.terminated {
            return None;
        }
        match self.receiver.blocking_recv() {
            Some(event) => {
                if event.is_terminal() {
                    self.terminated = true;
                    self.join_coordinator();
                }
                Some(event)
            }
            None => {
                // Channel closed without a terminal event: the coordinator died.
                self.terminated = true;
                self.join_coordinator();
                Some(ProgressEvent::Failed {
                    error: "acquisition stopped unexpectedly".to_string(),
                    no_media: false,
                })
            }
        }
    }
}

struct EventSink {
    sender: mpsc::Sender<ProgressEvent>,
}

impl EventSink {
    fn emit(&self, event: ProgressEvent) {
        if self.sender.blocking_send(event).is_err() {
            debug!("Acquire[events]: consumer went away");
        }
    }
}

struct DownloadJob {
    result_index: usize,
    relative_name: String,
    destination: PathBuf,
    source_url: String,
}

#[derive(Clone)]
pub struct AcquisitionPipeline {
    asset_cache: Arc<AssetIndexCache>,
    fetcher: Arc<dyn MediaFetcher>,
    config: AcquisitionConfig,
}

impl AcquisitionPipeline {
    pub fn new(
        asset_cache: Arc<AssetIndexCache>,
        fetcher: Arc<dyn MediaFetcher>,
        config: AcquisitionConfig,
    ) -> Self {
        Self {
            asset_cache,
            fetcher,
            config,
        }
    }

    /// Starts acquiring media for `targets` into a zip archive at `output_path`.
    pub fn acquire(&self, targets: Vec<AcquisitionTarget>, output_path: PathBuf) -> ProgressStream {
        let (sender, receiver) = mpsc::channel(self.config.progress_buffer.max(1));
        let pipeline = self.clone();
        let spawn_sender = sender.clone();
        let coordinator = thread::Builder::new()
            .name("acquire-coordinator".to_string())
            .spawn(move || {
                let sink = EventSink {
                    sender: spawn_sender,
                };
                pipeline.run(targets, &output_path, &sink);
            });

        let coordinator = match coordinator {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!("Acquire[coordinator]: failed to spawn: {}", err);
                let _ = sender.try_send(ProgressEvent::Failed {
                    error: format!("failed to start acquisition: {err}"),
                    no_media: false,
                });
                None
            }
        };
        drop(sender);

        ProgressStream {
            receiver,
            coordinator,
            terminated: false,
        }
    }

    fn run(&self, targets: Vec<AcquisitionTarget>, output_path: &Path, sink: &EventSink) {
        let targets = dedup_targets(targets);
        sink.emit(ProgressEvent::Started {
            identities: targets.len(),
            progress: 0,
        });
        let terminal = match self.run_stages(targets, output_path, sink) {
            Ok(event) => event,
            Err(err) => {
                warn!("Acquire[batch]: {}", err);
                ProgressEvent::Failed {
                    no_media: matches!(err, AcquireError::NoMedia),
                    error: err.to_string(),
                }
            }
        };
        sink.emit(terminal);
    }

    fn staging_dir(&self) -> Result<tempfile::TempDir, AcquireError> {
        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("bahalist-");
            builder
        };
        match &self.config.work_dir {
            Some(parent) => {
                fs::create_dir_all(parent).map_err(AcquireError::WorkDir)?;
                builder.tempdir_in(parent).map_err(AcquireError::WorkDir)
            }
            None => builder.tempdir().map_err(AcquireError::WorkDir),
        }
    }

    fn run_stages(
        &self,
        targets: Vec<AcquisitionTarget>,
        output_path: &Path,
        sink: &EventSink,
    ) -> Result<ProgressEvent, AcquireError> {
        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| AcquireError::OutputPath {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        // Removed on drop, on every exit path below.
        let staging = self.staging_dir()?;
        let mut report = BatchReport::default();

        let lookups = self.lookup_media(targets, sink, &mut report);
        let (mut results, jobs) = plan_downloads(staging.path(), lookups);
        if jobs.is_empty() {
            return Err(AcquireError::NoMedia);
        }
        for folder in &results {
            let folder_path = staging.path().join(&folder.folder_name);
            fs::create_dir_all(&folder_path).map_err(AcquireError::WorkDir)?;
        }

        sink.emit(ProgressEvent::DownloadsQueued {
            files: jobs.len(),
            progress: SEARCH_PROGRESS_END,
        });
        self.download_all(jobs, sink, &mut results, &mut report);

        sink.emit(ProgressEvent::Packaging {
            progress: PACKAGING_PROGRESS,
        });
        let archived = write_archive(staging.path(), output_path)?;
        info!(
            "Acquire[batch]: archived {} file(s) into {}",
            archived,
            output_path.display()
        );

        Ok(ProgressEvent::Finished {
            filename: output_path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| output_path.display().to_string()),
            results,
            report,
            progress: DONE_PROGRESS,
        })
    }

    /// Fetches every target's media links with bounded parallelism, in input order.
    fn lookup_media(
        &self,
        targets: Vec<AcquisitionTarget>,
        sink: &EventSink,
        report: &mut BatchReport,
    ) -> Vec<(AcquisitionTarget, Vec<MediaLink>)> {
        let total = targets.len();
        let mut slots: Vec<Option<(AcquisitionTarget, Vec<MediaLink>)>> = vec![None; total];
        let mut completed = 0;

        run_bounded(
            targets,
            self.config.metadata_workers.max(1),
            |target| {
                let links = self.asset_cache.get_assets(target.canonical_id);
                (target, links)
            },
            |index, (target, links)| {
                completed += 1;
                let progress = stage_progress(0, SEARCH_PROGRESS_END, completed, total);
                if links.is_empty() {
                    debug!("Acquire[{}]: no media for {}", target.canonical_id, target.title);
                    report.record(target.title.clone(), ItemOutcome::Skipped);
                    sink.emit(ProgressEvent::Skipped {
                        title: target.title.clone(),
                        completed,
                        total,
                        progress,
                    });
                } else {
                    sink.emit(ProgressEvent::Searched {
                        title: target.title.clone(),
                        themes: links.len(),
                        completed,
                        total,
                        progress,
                    });
                }
                slots[index] = Some((target, links));
            },
        );

        slots.into_iter().flatten().collect()
    }

    fn download_all(
        &self,
        jobs: Vec<DownloadJob>,
        sink: &EventSink,
        results: &mut [AcquisitionResult],
        report: &mut BatchReport,
    ) {
        let total = jobs.len();
        let mut completed = 0;
        run_bounded(
            jobs,
            self.config.download_workers.max(1),
            |job| {
                let outcome = download_one(self.fetcher.as_ref(), &job);
                (job, outcome)
            },
            |_, (job, outcome)| {
                completed += 1;
                let ok = outcome.is_ok();
                match outcome {
                    Ok(bytes) => {
                        debug!("Acquire[download]: {} ({} bytes)", job.relative_name, bytes);
                        results[job.result_index].files_written += 1;
                        report.record(job.relative_name.clone(), ItemOutcome::Succeeded);
                    }
                    Err(reason) => {
                        warn!("Acquire[download]: {} failed: {}", job.relative_name, reason);
                        report.record(job.relative_name.clone(), ItemOutcome::Failed(reason));
                    }
                }
                sink.emit(ProgressEvent::Downloaded {
                    file: job.relative_name,
                    ok,
                    completed,
                    total,
                    progress: stage_progress(
                        SEARCH_PROGRESS_END,
                        DOWNLOAD_PROGRESS_END,
                        completed,
                        total,
                    ),
                });
            },
        );
    }
}

/// Drops repeated canonical ids, keeping the first occurrence.
fn dedup_targets(targets: Vec<AcquisitionTarget>) -> Vec<AcquisitionTarget> {
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .filter(|target| seen.insert(target.canonical_id))
        .collect()
}

/// Assigns every link a collision-free relative path under its identity folder.
fn plan_downloads(
    staging_root: &Path,
    lookups: Vec<(AcquisitionTarget, Vec<MediaLink>)>,
) -> (Vec<AcquisitionResult>, Vec<DownloadJob>) {
    let mut results: Vec<AcquisitionResult> = Vec::new();
    let mut jobs = Vec::new();
    let mut used_names: HashSet<String> = HashSet::new();

    for (target, links) in lookups {
        if links.is_empty() {
            continue;
        }
        let folder_name = Some(sanitize_component(&target.title))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| target.canonical_id.to_string());
        let result_index = match results.iter().position(|r| r.folder_name == folder_name) {
            Some(index) => index,
            None => {
                results.push(AcquisitionResult {
                    folder_name: folder_name.clone(),
                    files_written: 0,
                });
                results.len() - 1
            }
        };

        for link in links {
            let stem = sanitize_component(&format!("{} - {}", link.theme_type, link.song_title));
            let extension = extension_from_link(&link.source_url);
            let file_name = unique_file_name(&stem, &extension, |candidate| {
                used_names.contains(&format!("{folder_name}/{candidate}"))
            });
            let relative_name = format!("{folder_name}/{file_name}");
            used_names.insert(relative_name.clone());
            jobs.push(DownloadJob {
                result_index,
                destination: staging_root.join(&folder_name).join(&file_name),
                relative_name,
                source_url: link.source_url,
            });
        }
    }
    (results, jobs)
}

/// Streams one file to disk. A failed download leaves no partial file behind.
fn download_one(fetcher: &dyn MediaFetcher, job: &DownloadJob) -> Result<u64, String> {
    let file = File::create(&job.destination).map_err(|err| err.to_string())?;
    let mut writer = BufWriter::new(file);
    let outcome = fetcher
        .fetch_to(&job.source_url, &mut writer)
        .map_err(|err| err.to_string())
        .and_then(|bytes| {
            io::Write::flush(&mut writer)
                .map(|()| bytes)
                .map_err(|err| err.to_string())
        });
    if outcome.is_err() {
        drop(writer);
        let _ = fs::remove_file(&job.destination);
    }
    outcome
}

/// Writes every staged file into an uncompressed zip at `output_path`.
fn write_archive(staging_root: &Path, output_path: &Path) -> Result<usize, AcquireError> {
    let file = File::create(output_path).map_err(|source| AcquireError::OutputPath {
        path: output_path.to_path_buf(),
        source,
    })?;
    let outcome = (|| -> Result<usize, AcquireError> {
        let mut archive = ZipWriter::new(BufWriter::new(file));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let files = collect_files_for_archive(staging_root);
        for (path, name) in &files {
            archive.start_file(name.as_str(), options)?;
            let mut source = File::open(path).map_err(|err| AcquireError::Archive(err.to_string()))?;
            io::copy(&mut source, &mut archive)
                .map_err(|err| AcquireError::Archive(err.to_string()))?;
        }
        let mut writer = archive.finish()?;
        io::Write::flush(&mut writer).map_err(|err| AcquireError::Archive(err.to_string()))?;
        Ok(files.len())
    })();
    if outcome.is_err() {
        let _ = fs::remove_file(output_path);
    }
    outcome
}
