use crate::bridge::{BridgeConfig, ToolkitBridge};
use crate::core::clip::{ClipEngine, ClipGeometry};
use crate::core::qa_filter::QaFilter;
use crate::core::region::RegionResolver;
use crate::core::reproject::ReprojectionEngine;
use crate::io::export::ExportManager;
use crate::io::granule::GranuleReader;
use crate::types::{
    ArtifactStatus, BatchJob, BatchStatus, ExportArtifact, GranuleFormat, JobResult, JobStatus,
    MisrError, MisrResult, ProcessingConfig, RasterTile, RegionSpec, SourceGranule,
};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Uniform interface over the two processing backends; callers never see
/// which backend served a job
pub trait SwathBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(
        &self,
        granule: &SourceGranule,
        config: &ProcessingConfig,
        region: &RegionSpec,
    ) -> MisrResult<RasterTile>;
}

impl SwathBackend for ReprojectionEngine {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn process(
        &self,
        granule: &SourceGranule,
        _config: &ProcessingConfig,
        region: &RegionSpec,
    ) -> MisrResult<RasterTile> {
        self.reproject(granule, region)
    }
}

impl SwathBackend for ToolkitBridge {
    fn name(&self) -> &'static str {
        "toolkit"
    }

    fn process(
        &self,
        granule: &SourceGranule,
        config: &ProcessingConfig,
        region: &RegionSpec,
    ) -> MisrResult<RasterTile> {
        self.submit(granule, config, region)
    }
}

/// Snapshot emitted after every finished file, in completion order
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Submission index of the granule within the batch
    pub index: usize,
    pub total: usize,
    pub filename: String,
    pub status: JobStatus,
    pub message: String,
}

/// Receiver for per-file progress; supplied by the caller (typically a
/// GUI channel) and invoked synchronously from worker threads
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate);
}

impl<F: Fn(&ProgressUpdate) + Send + Sync> ProgressSink for F {
    fn on_progress(&self, update: &ProgressUpdate) {
        self(update)
    }
}

/// Sink that discards all updates
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn on_progress(&self, _update: &ProgressUpdate) {}
}

/// Poll-able cooperative cancellation flag
///
/// Checked between job dispatches: in-flight files finish, no new file
/// starts once the flag is raised.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Schedules granules over a bounded worker pool and aggregates per-file
/// results
///
/// One file's failure never stops the batch; only setup errors (invalid
/// config or region, unloadable clip geometry, toolkit runtime missing
/// when every granule needs it) propagate out of `run`.
pub struct BatchOrchestrator {
    config: ProcessingConfig,
    resolver: RegionResolver,
    bridge: ToolkitBridge,
}

impl BatchOrchestrator {
    pub fn new(config: ProcessingConfig) -> Self {
        Self::with_bridge(config, BridgeConfig::default())
    }

    pub fn with_bridge(config: ProcessingConfig, bridge_config: BridgeConfig) -> Self {
        Self {
            config,
            resolver: RegionResolver::new(),
            bridge: ToolkitBridge::new(bridge_config),
        }
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    /// Process a batch with the production backends
    ///
    /// The bridge worker is terminated when the batch completes or is
    /// cancelled.
    pub fn run(
        &self,
        granules: &[SourceGranule],
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> MisrResult<BatchJob> {
        // When the whole batch depends on the toolkit, a missing runtime
        // is a setup failure, not N per-file failures
        if !granules.is_empty()
            && granules
                .iter()
                .all(|g| g.format == GranuleFormat::ToolkitOnly)
        {
            self.bridge.ensure_available()?;
        }

        let engine = ReprojectionEngine::new(
            self.config.field_name.clone(),
            self.config.enable_qa_filtering,
        );
        let result = self.run_with_backends(granules, &engine, &self.bridge, progress, cancel);
        self.bridge.shutdown();
        result
    }

    /// Process a batch with explicit backends
    ///
    /// `run` wires in the production pair; this seam lets callers (and
    /// tests) substitute either side.
    pub fn run_with_backends(
        &self,
        granules: &[SourceGranule],
        in_process: &dyn SwathBackend,
        toolkit: &dyn SwathBackend,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> MisrResult<BatchJob> {
        // resolve() re-checks the config invariants before anything runs
        let region = self.resolver.resolve(&self.config)?;
        let clip = self.build_clip_engine(&region)?;
        let qa = QaFilter::from_config(&self.config);
        let exporter = ExportManager::from_config(&self.config);

        let started = Utc::now();
        let total = granules.len();
        log::info!(
            "Starting batch of {} granules with {} workers",
            total,
            self.config.max_workers
        );

        let next = AtomicUsize::new(0);
        let results: Mutex<Vec<JobResult>> = Mutex::new(Vec::with_capacity(total));
        let unavailable_reported = AtomicBool::new(false);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.max_workers)
            .thread_name(|i| format!("misr-worker-{}", i))
            .build()
            .map_err(|e| MisrError::Processing(format!("cannot build worker pool: {}", e)))?;

        pool.scope(|scope| {
            for _ in 0..self.config.max_workers {
                scope.spawn(|_| loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    if index >= total {
                        break;
                    }
                    let granule = &granules[index];
                    let backend = match granule.format {
                        GranuleFormat::InProcess => in_process,
                        GranuleFormat::ToolkitOnly => toolkit,
                    };

                    let result = self.process_one(
                        granule,
                        backend,
                        &region,
                        &qa,
                        &clip,
                        &exporter,
                        &unavailable_reported,
                    );

                    progress.on_progress(&ProgressUpdate {
                        index,
                        total,
                        filename: granule.file_name(),
                        status: result.status,
                        message: progress_message(&result),
                    });
                    results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(result);
                });
            }
        });

        let results = results.into_inner().unwrap_or_else(PoisonError::into_inner);
        let status = if cancel.is_cancelled() {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Completed
        };

        let job = BatchJob {
            config: self.config.clone(),
            region,
            results,
            status,
            started,
            finished: Some(Utc::now()),
        };
        log::info!(
            "Batch {}: {} succeeded, {} skipped, {} failed of {} granules",
            match job.status {
                BatchStatus::Cancelled => "cancelled",
                _ => "complete",
            },
            job.success_count(),
            job.skipped_count(),
            job.failed_count(),
            total
        );
        Ok(job)
    }

    fn build_clip_engine(&self, region: &RegionSpec) -> MisrResult<ClipEngine> {
        if !self.config.enable_clipping {
            return Ok(ClipEngine::disabled());
        }
        let path = self.config.shapefile_path.as_ref().ok_or_else(|| {
            MisrError::Config("clipping enabled but no clip geometry configured".to_string())
        })?;
        let geometry = ClipGeometry::from_vector_file(path)?;
        Ok(ClipEngine::new(&geometry, region))
    }

    #[allow(clippy::too_many_arguments)]
    fn process_one(
        &self,
        granule: &SourceGranule,
        backend: &dyn SwathBackend,
        region: &RegionSpec,
        qa: &QaFilter,
        clip: &ClipEngine,
        exporter: &ExportManager,
        unavailable_reported: &AtomicBool,
    ) -> JobResult {
        let start = Instant::now();
        log::info!(
            "Processing {} via {} backend",
            granule.file_name(),
            backend.name()
        );

        let outcome = self
            .process_tile(granule, backend, region)
            .and_then(|tile| {
                let (tile, _mask) = qa.apply(tile);
                let tile = clip.clip(tile);
                let stats = tile.statistics();
                let artifacts = exporter.export(&tile, &self.config, &granule.stem)?;
                Ok((artifacts, stats))
            });

        match outcome {
            Ok((artifacts, stats)) => {
                let (status, error) = summarize_artifacts(&artifacts);
                log::info!(
                    "{}: {} ({:.1}% valid pixels) in {:.1}s",
                    granule.file_name(),
                    status,
                    stats.valid_percentage(),
                    start.elapsed().as_secs_f64()
                );
                JobResult {
                    granule: granule.path.clone(),
                    status,
                    artifacts,
                    error,
                    elapsed: start.elapsed(),
                    statistics: Some(stats),
                }
            }
            Err(e) => {
                if matches!(e, MisrError::ToolkitUnavailable(_)) {
                    if !unavailable_reported.swap(true, Ordering::SeqCst) {
                        log::error!(
                            "Toolkit runtime unavailable, all toolkit-only granules will fail: {}",
                            e
                        );
                    }
                } else {
                    log::error!("Failed to process {}: {}", granule.file_name(), e);
                }
                JobResult {
                    granule: granule.path.clone(),
                    status: JobStatus::Failed,
                    artifacts: Vec::new(),
                    error: Some(e.to_string()),
                    elapsed: start.elapsed(),
                    statistics: None,
                }
            }
        }
    }

    fn process_tile(
        &self,
        granule: &SourceGranule,
        backend: &dyn SwathBackend,
        region: &RegionSpec,
    ) -> MisrResult<RasterTile> {
        if self.config.validate_inputs && granule.format == GranuleFormat::InProcess {
            let reader = GranuleReader::open(granule)?;
            reader.validate(&self.config.field_name)?;
        }
        backend.process(granule, &self.config, region)
    }
}

/// Derive the file-level status from its artifact statuses: one written
/// artifact makes the file a success, skips alone make it skipped
fn summarize_artifacts(artifacts: &[ExportArtifact]) -> (JobStatus, Option<String>) {
    let any_written = artifacts
        .iter()
        .any(|a| a.status == ArtifactStatus::Written);
    let failures: Vec<String> = artifacts
        .iter()
        .filter_map(|a| match &a.status {
            ArtifactStatus::Failed(msg) => Some(format!("{}: {}", a.format, msg)),
            _ => None,
        })
        .collect();

    let status = if any_written {
        JobStatus::Success
    } else if !failures.is_empty() {
        JobStatus::Failed
    } else {
        JobStatus::Skipped
    };
    let error = (!failures.is_empty()).then(|| failures.join("; "));
    (status, error)
}

fn progress_message(result: &JobResult) -> String {
    match result.status {
        JobStatus::Success => {
            let written = result
                .artifacts
                .iter()
                .filter(|a| a.status == ArtifactStatus::Written)
                .count();
            format!("exported {} artifact(s)", written)
        }
        JobStatus::Skipped => "all outputs exist, skipped".to_string(),
        JobStatus::Failed => result
            .error
            .clone()
            .unwrap_or_else(|| "processing failed".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExportFormat;
    use std::path::PathBuf;

    fn artifact(format: ExportFormat, status: ArtifactStatus) -> ExportArtifact {
        ExportArtifact {
            format,
            path: PathBuf::from("out"),
            status,
        }
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_one_written_artifact_is_success() {
        let (status, error) = summarize_artifacts(&[
            artifact(ExportFormat::GeoTiff, ArtifactStatus::Written),
            artifact(
                ExportFormat::NetCdf,
                ArtifactStatus::Failed("disk full".to_string()),
            ),
        ]);
        assert_eq!(status, JobStatus::Success);
        // Partial failures are still recorded
        assert!(error.unwrap().contains("disk full"));
    }

    #[test]
    fn test_all_skipped_is_skipped() {
        let (status, error) = summarize_artifacts(&[
            artifact(ExportFormat::GeoTiff, ArtifactStatus::SkippedExisting),
            artifact(ExportFormat::NetCdf, ArtifactStatus::SkippedExisting),
        ]);
        assert_eq!(status, JobStatus::Skipped);
        assert!(error.is_none());
    }

    #[test]
    fn test_all_failed_is_failed() {
        let (status, error) = summarize_artifacts(&[artifact(
            ExportFormat::GeoTiff,
            ArtifactStatus::Failed("boom".to_string()),
        )]);
        assert_eq!(status, JobStatus::Failed);
        assert!(error.unwrap().contains("boom"));
    }

    #[test]
    fn test_closure_implements_progress_sink() {
        let count = std::sync::atomic::AtomicUsize::new(0);
        let sink = |_: &ProgressUpdate| {
            count.fetch_add(1, Ordering::SeqCst);
        };
        let update = ProgressUpdate {
            index: 0,
            total: 1,
            filename: "g.nc".to_string(),
            status: JobStatus::Success,
            message: String::new(),
        };
        ProgressSink::on_progress(&sink, &update);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
