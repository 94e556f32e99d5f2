use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Real-valued raster plane aligned to a target grid
pub type RasterGrid = Array2<f32>;

/// Per-pixel RDQI plane (0 = best .. 3 = unusable)
pub type QaGrid = Array2<u8>;

/// Nodata sentinel written into exported artifacts
pub const EXPORT_NODATA: f32 = -9999.0;

/// Geodetic bounding box in WGS84 degrees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }
}

/// Source granule format, resolved once at enumeration time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GranuleFormat {
    /// NetCDF-class granule, readable in-process through GDAL
    InProcess,
    /// HDF granule readable only through the isolated MISR Toolkit runtime
    ToolkitOnly,
}

impl std::fmt::Display for GranuleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GranuleFormat::InProcess => write!(f, "netcdf"),
            GranuleFormat::ToolkitOnly => write!(f, "toolkit"),
        }
    }
}

/// Output artifact format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    GeoTiff,
    NetCdf,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::GeoTiff => "tif",
            ExportFormat::NetCdf => "nc",
        }
    }

    /// GDAL driver short name
    pub fn driver(&self) -> &'static str {
        match self {
            ExportFormat::GeoTiff => "GTiff",
            ExportFormat::NetCdf => "netCDF",
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportFormat::GeoTiff => write!(f, "GeoTIFF"),
            ExportFormat::NetCdf => write!(f, "NetCDF"),
        }
    }
}

/// Immutable batch processing configuration
///
/// Supplied fully validated by the caller (config loading itself is out of
/// scope); `validate` re-checks the structural invariants before a batch
/// starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    // Target region
    pub target_lat: f64,
    pub target_lon: f64,
    pub region_margin: f64,
    pub target_resolution: f64,

    // Field selection (toolkit spelling, e.g. "Red Radiance/RDQI")
    pub field_name: String,

    // QA filtering
    pub enable_qa_filtering: bool,
    pub max_rdqi: u8,

    // Clipping
    pub enable_clipping: bool,
    pub shapefile_path: Option<PathBuf>,

    // Export settings
    pub output_directory: PathBuf,
    pub export_netcdf: bool,
    pub export_geotiff: bool,
    pub add_timestamp: bool,

    // Processing options
    pub overwrite_existing: bool,
    pub validate_inputs: bool,
    pub max_workers: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            target_lat: -13.8,
            target_lon: -70.8,
            region_margin: 2.0,
            target_resolution: 0.0025,
            field_name: "Red Radiance/RDQI".to_string(),
            enable_qa_filtering: false,
            max_rdqi: 1,
            enable_clipping: false,
            shapefile_path: None,
            output_directory: PathBuf::from("."),
            export_netcdf: false,
            export_geotiff: true,
            add_timestamp: true,
            overwrite_existing: false,
            validate_inputs: true,
            max_workers: 2,
        }
    }
}

impl ProcessingConfig {
    /// Check structural invariants; called once before a batch starts
    pub fn validate(&self) -> MisrResult<()> {
        if !self.target_resolution.is_finite() || self.target_resolution <= 0.0 {
            return Err(MisrError::Config(format!(
                "target resolution must be positive, got {}",
                self.target_resolution
            )));
        }
        if !self.region_margin.is_finite() || self.region_margin < 0.0 {
            return Err(MisrError::Config(format!(
                "region margin must be non-negative, got {}",
                self.region_margin
            )));
        }
        if !self.export_geotiff && !self.export_netcdf {
            return Err(MisrError::Config(
                "at least one export format must be enabled".to_string(),
            ));
        }
        if self.enable_clipping && self.shapefile_path.is_none() {
            return Err(MisrError::Config(
                "clipping enabled but no clip geometry configured".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(MisrError::Config(
                "worker pool size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn export_formats(&self) -> Vec<ExportFormat> {
        let mut formats = Vec::new();
        if self.export_geotiff {
            formats.push(ExportFormat::GeoTiff);
        }
        if self.export_netcdf {
            formats.push(ExportFormat::NetCdf);
        }
        formats
    }
}

/// Target grid derived from a `ProcessingConfig`, shared across a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSpec {
    pub bbox: BoundingBox,
    pub resolution: f64,
    pub rows: usize,
    pub cols: usize,
}

impl RegionSpec {
    /// North-up GDAL geotransform for the target grid
    pub fn geo_transform(&self) -> [f64; 6] {
        [
            self.bbox.min_lon,
            self.resolution,
            0.0,
            self.bbox.max_lat,
            0.0,
            -self.resolution,
        ]
    }

    /// Geodetic coordinates of a cell center (row 0 is the northern edge)
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        let lat = self.bbox.max_lat - (row as f64 + 0.5) * self.resolution;
        let lon = self.bbox.min_lon + (col as f64 + 0.5) * self.resolution;
        (lat, lon)
    }

    pub fn cell_count(&self) -> usize {
        self.rows * self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }
}

/// A single input file, read-only after enumeration
#[derive(Debug, Clone)]
pub struct SourceGranule {
    pub path: PathBuf,
    pub format: GranuleFormat,
    /// Filename without extension, used as the output stem
    pub stem: String,
}

impl SourceGranule {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Reprojected raster aligned to a `RegionSpec` grid
///
/// Nodata is `f32::NAN` in memory; exporters substitute `EXPORT_NODATA`.
/// Ownership moves stage to stage through the pipeline.
#[derive(Debug, Clone)]
pub struct RasterTile {
    pub data: RasterGrid,
    /// Co-registered RDQI plane, present only when the reader produced one
    pub qa: Option<QaGrid>,
    pub region: RegionSpec,
    pub band_name: String,
    pub units: Option<String>,
    pub source: PathBuf,
}

impl RasterTile {
    pub fn valid_pixels(&self) -> usize {
        self.data.iter().filter(|v| v.is_finite()).count()
    }

    pub fn statistics(&self) -> TileStatistics {
        let total_pixels = self.data.len();
        let mut valid_pixels = 0usize;
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0f64;

        for &v in self.data.iter() {
            if v.is_finite() {
                valid_pixels += 1;
                min = min.min(v);
                max = max.max(v);
                sum += v as f64;
            }
        }

        TileStatistics {
            valid_pixels,
            total_pixels,
            min_value: (valid_pixels > 0).then_some(min as f64),
            max_value: (valid_pixels > 0).then_some(max as f64),
            mean_value: (valid_pixels > 0).then(|| sum / valid_pixels as f64),
        }
    }
}

/// Valid-pixel statistics for a reprojected tile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileStatistics {
    pub valid_pixels: usize,
    pub total_pixels: usize,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub mean_value: Option<f64>,
}

impl TileStatistics {
    pub fn valid_percentage(&self) -> f64 {
        if self.total_pixels == 0 {
            0.0
        } else {
            100.0 * self.valid_pixels as f64 / self.total_pixels as f64
        }
    }
}

/// Write status of a single output artifact
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactStatus {
    Written,
    SkippedExisting,
    Failed(String),
}

/// One (format, path) output of a processed granule
#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub format: ExportFormat,
    pub path: PathBuf,
    pub status: ArtifactStatus,
}

/// Outcome class of a single granule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    Skipped,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Success => write!(f, "success"),
            JobStatus::Skipped => write!(f, "skipped"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of processing one granule, immutable once finalized
#[derive(Debug, Clone)]
pub struct JobResult {
    pub granule: PathBuf,
    pub status: JobStatus,
    pub artifacts: Vec<ExportArtifact>,
    pub error: Option<String>,
    pub elapsed: Duration,
    pub statistics: Option<TileStatistics>,
}

/// Overall batch state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Running,
    Completed,
    Cancelled,
}

/// Aggregate of one batch run, owned by the orchestrator
#[derive(Debug)]
pub struct BatchJob {
    pub config: ProcessingConfig,
    pub region: RegionSpec,
    pub results: Vec<JobResult>,
    pub status: BatchStatus,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
}

impl BatchJob {
    pub fn success_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == JobStatus::Success)
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == JobStatus::Skipped)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == JobStatus::Failed)
            .count()
    }

    pub fn total_elapsed(&self) -> Duration {
        self.results.iter().map(|r| r.elapsed).sum()
    }
}

/// Error types for MISR processing
#[derive(Debug, thiserror::Error)]
pub enum MisrError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid region: {0}")]
    InvalidRegion(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("geometry mismatch: {0}")]
    GeometryMismatch(String),

    #[error("toolkit runtime unavailable: {0}")]
    ToolkitUnavailable(String),

    #[error("toolkit bridge timed out after {0:?}")]
    BridgeTimeout(Duration),

    #[error("toolkit bridge protocol violation: {0}")]
    BridgeProtocol(String),

    #[error("toolkit worker failed: {0}")]
    BridgeWorker(String),

    #[error("output already exists: {}", .0.display())]
    OutputExists(PathBuf),

    #[error("export failed: {0}")]
    Export(String),

    #[error("processing error: {0}")]
    Processing(String),
}

/// Result type for MISR processing operations
pub type MisrResult<T> = Result<T, MisrError>;
