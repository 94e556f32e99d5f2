//! Out-of-process backend for toolkit-only granules
//!
//! The MISR Toolkit pins native library versions that cannot coexist with
//! the in-process GDAL stack, so toolkit-only granules are handed to a
//! single long-lived worker process over a newline-delimited JSON
//! protocol. The worker is spawned lazily on the first toolkit job,
//! reused for the rest of the batch, and torn down when the batch ends,
//! is cancelled, or the worker stops responding.

pub mod protocol;

use crate::io::granule::band_tag;
use crate::types::{
    MisrError, MisrResult, ProcessingConfig, RasterTile, RegionSpec, SourceGranule,
};
use gdal::Dataset;
use ndarray::Array2;
use self::protocol::{
    decode_response, encode_request, ResponseStatus, WorkerRequest, WorkerResponse,
};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{mpsc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Worker launch and protocol settings
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Worker program plus arguments, e.g.
    /// `["conda", "run", "-n", "misr-toolkit-py36", "misr-toolkit-worker"]`
    pub command: Vec<String>,
    /// Bounded wait per request; on expiry the worker is killed
    pub request_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: vec!["misr-toolkit-worker".to_string()],
            request_timeout: Duration::from_secs(300),
        }
    }
}

struct WorkerHandle {
    child: Child,
    stdin: ChildStdin,
    /// Lines from the reader thread; disconnects when the worker exits
    lines: Receiver<String>,
}

struct BridgeState {
    worker: Option<WorkerHandle>,
    next_id: u64,
    /// Latched launch failure, reported once and returned for every
    /// subsequent toolkit job without retrying the spawn
    unavailable: Option<String>,
}

enum ExchangeError {
    Timeout(Duration),
    Crash(String),
    Protocol(String),
}

/// Bridge to the isolated toolkit runtime
///
/// All mutable state (process handle, id counter) sits behind one mutex:
/// at most one request is in flight against the worker at a time, which
/// also serializes toolkit jobs across the batch pool.
pub struct ToolkitBridge {
    config: BridgeConfig,
    state: Mutex<BridgeState>,
}

impl ToolkitBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BridgeState {
                worker: None,
                next_id: 1,
                unavailable: None,
            }),
        }
    }

    /// Spawn the worker now if it is not already running
    ///
    /// Lets the orchestrator fail a batch up front when every granule
    /// needs the toolkit and the runtime cannot be launched at all.
    pub fn ensure_available(&self) -> MisrResult<()> {
        let mut state = self.lock_state();
        self.ensure_worker(&mut state)
    }

    /// Process one toolkit-only granule through the worker
    pub fn submit(
        &self,
        granule: &SourceGranule,
        config: &ProcessingConfig,
        region: &RegionSpec,
    ) -> MisrResult<RasterTile> {
        let mut state = self.lock_state();
        self.ensure_worker(&mut state)?;

        let id = state.next_id;
        state.next_id += 1;
        let request = WorkerRequest::process(id, granule, config);
        log::info!(
            "Dispatching {} to toolkit worker (request {})",
            granule.file_name(),
            id
        );

        let response = self.exchange(&mut state, &request)?;
        match response.status {
            ResponseStatus::Ok => self.ingest_artifact(&response, granule, config, region),
            ResponseStatus::Error => Err(MisrError::BridgeWorker(
                response
                    .error
                    .unwrap_or_else(|| "worker reported an unspecified error".to_string()),
            )),
        }
    }

    /// Terminate the worker process if running
    ///
    /// Called when the batch completes or is cancelled so no orphaned
    /// runtime outlives the run. The bridge can spawn a fresh worker
    /// afterwards.
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        if state.worker.is_some() {
            log::info!("Shutting down toolkit worker");
        }
        teardown_worker(&mut state);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_worker(&self, state: &mut BridgeState) -> MisrResult<()> {
        if let Some(reason) = &state.unavailable {
            return Err(MisrError::ToolkitUnavailable(reason.clone()));
        }
        if state.worker.is_none() {
            match self.spawn_worker() {
                Ok(worker) => state.worker = Some(worker),
                Err(e) => {
                    if let MisrError::ToolkitUnavailable(reason) = &e {
                        state.unavailable = Some(reason.clone());
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn spawn_worker(&self) -> MisrResult<WorkerHandle> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| MisrError::Config("empty toolkit worker command".to_string()))?;

        log::info!("Launching toolkit worker: {}", self.config.command.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                MisrError::ToolkitUnavailable(format!("cannot launch '{}': {}", program, e))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            MisrError::ToolkitUnavailable("worker stdin channel unavailable".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            MisrError::ToolkitUnavailable("worker stdout channel unavailable".to_string())
        })?;

        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("toolkit-bridge-reader".to_string())
            .spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    match line {
                        Ok(line) => {
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            })?;

        Ok(WorkerHandle {
            child,
            stdin,
            lines: rx,
        })
    }

    /// Send one request and wait for its matching response
    ///
    /// On a crash the worker is restarted transparently once and the
    /// request resent; on timeout or protocol violation the worker is
    /// killed and the error surfaced for this job only.
    fn exchange(
        &self,
        state: &mut BridgeState,
        request: &WorkerRequest,
    ) -> MisrResult<WorkerResponse> {
        let mut restarted = false;
        loop {
            self.ensure_worker(state)?;
            let Some(worker) = state.worker.as_mut() else {
                return Err(MisrError::ToolkitUnavailable(
                    "worker is not running".to_string(),
                ));
            };
            match try_exchange(worker, request, self.config.request_timeout) {
                Ok(response) => return Ok(response),
                Err(ExchangeError::Crash(detail)) => {
                    teardown_worker(state);
                    if restarted {
                        return Err(MisrError::BridgeWorker(format!(
                            "worker crashed twice on request {}: {}",
                            request.id, detail
                        )));
                    }
                    restarted = true;
                    log::warn!("Toolkit worker crashed ({}), restarting once", detail);
                }
                Err(ExchangeError::Timeout(timeout)) => {
                    log::warn!(
                        "Toolkit worker unresponsive on request {}, killing it",
                        request.id
                    );
                    teardown_worker(state);
                    return Err(MisrError::BridgeTimeout(timeout));
                }
                Err(ExchangeError::Protocol(detail)) => {
                    log::warn!("Protocol violation from toolkit worker: {}", detail);
                    teardown_worker(state);
                    return Err(MisrError::BridgeProtocol(detail));
                }
            }
        }
    }

    /// Load the worker's output artifact into the orchestrator's address
    /// space, then delete it. The runtime boundary is crossed exactly once
    /// per job, through the file system.
    fn ingest_artifact(
        &self,
        response: &WorkerResponse,
        granule: &SourceGranule,
        config: &ProcessingConfig,
        region: &RegionSpec,
    ) -> MisrResult<RasterTile> {
        let artifact = response.artifact_path.as_deref().ok_or_else(|| {
            MisrError::BridgeProtocol(format!(
                "ok response for request {} carries no artifact path",
                response.id
            ))
        })?;

        let result = read_artifact(artifact, region);
        if let Err(e) = std::fs::remove_file(artifact) {
            log::warn!(
                "Could not remove worker artifact {}: {}",
                artifact.display(),
                e
            );
        }
        let data = result?;

        Ok(RasterTile {
            data,
            // The worker applies QA itself when requested
            qa: None,
            region: region.clone(),
            band_name: format!("{}_radiance", band_tag(&config.field_name)),
            units: Some("W/m²/sr/μm".to_string()),
            source: granule.path.clone(),
        })
    }
}

impl Drop for ToolkitBridge {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        teardown_worker(&mut state);
    }
}

fn try_exchange(
    worker: &mut WorkerHandle,
    request: &WorkerRequest,
    timeout: Duration,
) -> Result<WorkerResponse, ExchangeError> {
    let line = encode_request(request).map_err(|e| ExchangeError::Protocol(e.to_string()))?;
    writeln!(worker.stdin, "{}", line)
        .and_then(|_| worker.stdin.flush())
        .map_err(|e| ExchangeError::Crash(format!("stdin write failed: {}", e)))?;

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ExchangeError::Timeout(timeout));
        }
        match worker.lines.recv_timeout(remaining) {
            Ok(line) => {
                let response =
                    decode_response(&line).map_err(|e| ExchangeError::Protocol(e.to_string()))?;
                if response.id == request.id {
                    return Ok(response);
                }
                if response.id < request.id {
                    // Late answer to a request we already gave up on
                    log::debug!("Discarding stale response for request {}", response.id);
                    continue;
                }
                return Err(ExchangeError::Protocol(format!(
                    "response id {} is ahead of request id {}",
                    response.id, request.id
                )));
            }
            Err(RecvTimeoutError::Timeout) => return Err(ExchangeError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(ExchangeError::Crash(
                    "worker closed its output stream".to_string(),
                ))
            }
        }
    }
}

fn teardown_worker(state: &mut BridgeState) {
    if let Some(mut worker) = state.worker.take() {
        drop(worker.stdin);
        let _ = worker.child.kill();
        let _ = worker.child.wait();
    }
}

/// Read the worker's temporary raster into a region-aligned grid
fn read_artifact(path: &Path, region: &RegionSpec) -> MisrResult<Array2<f32>> {
    let dataset = Dataset::open(path).map_err(|e| {
        MisrError::BridgeWorker(format!(
            "cannot open worker artifact {}: {}",
            path.display(),
            e
        ))
    })?;

    let (width, height) = dataset.raster_size();
    if (height, width) != region.shape() {
        return Err(MisrError::GeometryMismatch(format!(
            "worker artifact grid {}x{} does not match target grid {}x{}",
            height, width, region.rows, region.cols
        )));
    }

    let rasterband = dataset.rasterband(1)?;
    let nodata = rasterband.no_data_value();
    let band_data = rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;

    let mut data = Array2::from_shape_vec((height, width), band_data.data)
        .map_err(|e| MisrError::Processing(format!("failed to reshape worker artifact: {}", e)))?;

    if let Some(nodata) = nodata {
        let nodata = nodata as f32;
        data.mapv_inplace(|v| if v == nodata { f32::NAN } else { v });
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.command, vec!["misr-toolkit-worker".to_string()]);
        assert_eq!(config.request_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_empty_command_rejected() {
        let bridge = ToolkitBridge::new(BridgeConfig {
            command: vec![],
            request_timeout: Duration::from_secs(1),
        });
        assert!(matches!(
            bridge.ensure_available(),
            Err(MisrError::Config(_))
        ));
    }

    #[test]
    fn test_unavailable_latched_after_spawn_failure() {
        let bridge = ToolkitBridge::new(BridgeConfig {
            command: vec!["misrproj-no-such-worker-binary".to_string()],
            request_timeout: Duration::from_secs(1),
        });

        assert!(matches!(
            bridge.ensure_available(),
            Err(MisrError::ToolkitUnavailable(_))
        ));
        // Second attempt fails fast from the latch without respawning
        assert!(matches!(
            bridge.ensure_available(),
            Err(MisrError::ToolkitUnavailable(_))
        ));
    }
}
