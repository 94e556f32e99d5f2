//! Core processing stages: region resolution, reprojection, QA
//! filtering, clipping, and batch orchestration

pub mod batch;
pub mod clip;
pub mod qa_filter;
pub mod region;
pub mod reproject;

// Re-export main types
pub use batch::{
    BatchOrchestrator, CancelToken, ProgressSink, ProgressUpdate, SilentProgress, SwathBackend,
};
pub use clip::{ClipEngine, ClipGeometry, Polygon};
pub use qa_filter::{QaFilter, QaMask};
pub use region::{RegionResolver, MAX_GRID_CELLS};
pub use reproject::{ReprojectionEngine, Resampling};
