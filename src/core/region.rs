use crate::types::{BoundingBox, MisrError, MisrResult, ProcessingConfig, RegionSpec};

/// Default ceiling on target grid cells, guarding against runaway
/// allocations from a malformed margin/resolution pair
pub const MAX_GRID_CELLS: usize = 64_000_000;

/// Turns a target coordinate plus margin into a geodetic bounding box and
/// output grid
///
/// The bbox is plain `target ± margin` arithmetic; regions crossing the
/// antimeridian or a pole are not handled and will simply never match
/// source pixels.
#[derive(Debug, Clone)]
pub struct RegionResolver {
    max_cells: usize,
}

impl Default for RegionResolver {
    fn default() -> Self {
        Self {
            max_cells: MAX_GRID_CELLS,
        }
    }
}

impl RegionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the grid-size ceiling
    pub fn with_max_cells(max_cells: usize) -> Self {
        Self { max_cells }
    }

    /// Compute the shared target grid for a batch
    ///
    /// Pure function of the configuration; the orchestrator caches the
    /// result since margin and resolution are batch-wide.
    pub fn resolve(&self, config: &ProcessingConfig) -> MisrResult<RegionSpec> {
        config.validate()?;

        let bbox = BoundingBox {
            min_lat: config.target_lat - config.region_margin,
            max_lat: config.target_lat + config.region_margin,
            min_lon: config.target_lon - config.region_margin,
            max_lon: config.target_lon + config.region_margin,
        };

        let rows = (bbox.height() / config.target_resolution).ceil() as usize;
        let cols = (bbox.width() / config.target_resolution).ceil() as usize;

        if rows == 0 || cols == 0 {
            return Err(MisrError::InvalidRegion(format!(
                "empty target grid ({}x{}) from margin {} at resolution {}",
                rows, cols, config.region_margin, config.target_resolution
            )));
        }

        let cells = rows
            .checked_mul(cols)
            .ok_or_else(|| MisrError::InvalidRegion("target grid size overflows".to_string()))?;
        if cells > self.max_cells {
            return Err(MisrError::InvalidRegion(format!(
                "target grid of {}x{} = {} cells exceeds maximum of {}",
                rows, cols, cells, self.max_cells
            )));
        }

        log::info!(
            "Resolved region: lat [{:.4}, {:.4}], lon [{:.4}, {:.4}], grid {}x{} at {}°/px",
            bbox.min_lat,
            bbox.max_lat,
            bbox.min_lon,
            bbox.max_lon,
            rows,
            cols,
            config.target_resolution
        );

        Ok(RegionSpec {
            bbox,
            resolution: config.target_resolution,
            rows,
            cols,
        })
    }
}
