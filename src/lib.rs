//! misrproj: a dual-backend batch reprojection engine for MISR
//! multi-angle imagery
//!
//! Turns MISR swath granules into analysis-ready regional rasters on a
//! shared lat/lon grid. NetCDF-class granules are reprojected in-process
//! through GDAL; HDF granules that only the version-pinned MISR Toolkit
//! can read are handed to an isolated worker process over a line-based
//! JSON protocol. Per-file QA filtering, polygon clipping, and
//! multi-format export run behind a batch orchestrator with bounded
//! concurrency, cooperative cancellation, and per-file failure isolation.

pub mod bridge;
pub mod core;
pub mod io;
pub mod types;

// Re-export main types and entry points for easier access
pub use types::{
    BatchJob, BatchStatus, BoundingBox, ExportArtifact, ExportFormat, GranuleFormat, JobResult,
    JobStatus, MisrError, MisrResult, ProcessingConfig, RasterTile, RegionSpec, SourceGranule,
};

pub use crate::bridge::{BridgeConfig, ToolkitBridge};
pub use crate::core::{
    BatchOrchestrator, CancelToken, ProgressSink, ProgressUpdate, RegionResolver, SwathBackend,
};
pub use crate::io::{ExportManager, GranuleReader};
