use crate::types::{ProcessingConfig, RasterTile};
use ndarray::{Array2, Zip};

/// Per-pixel acceptance mask derived from the RDQI plane (true = keep)
pub type QaMask = Array2<bool>;

/// RDQI-based quality filter
///
/// MISR encodes retrieval quality as a 2-bit RDQI: 0 = best, 1 = usable,
/// 2 = poor, 3 = unusable. Pixels above the configured threshold are set
/// to nodata in the radiance plane.
#[derive(Debug, Clone)]
pub struct QaFilter {
    enabled: bool,
    max_rdqi: u8,
}

impl QaFilter {
    pub fn new(enabled: bool, max_rdqi: u8) -> Self {
        Self { enabled, max_rdqi }
    }

    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self::new(config.enable_qa_filtering, config.max_rdqi)
    }

    /// Mask the tile against its RDQI plane
    ///
    /// Identity when filtering is disabled or the tile carries no RDQI
    /// plane (toolkit-backend tiles arrive pre-filtered). The RDQI plane
    /// is consumed either way; the returned mask is not retained.
    pub fn apply(&self, mut tile: RasterTile) -> (RasterTile, Option<QaMask>) {
        let qa = tile.qa.take();

        if !self.enabled {
            return (tile, None);
        }
        let Some(qa) = qa else {
            log::debug!("{}: no RDQI plane to filter against", tile.source.display());
            return (tile, None);
        };

        let mask = qa.mapv(|rdqi| rdqi <= self.max_rdqi);
        let mut masked = 0usize;
        Zip::from(&mut tile.data).and(&mask).for_each(|v, &keep| {
            if !keep && v.is_finite() {
                *v = f32::NAN;
                masked += 1;
            }
        });

        log::info!(
            "QA filtering (RDQI <= {}) masked {} pixels in {}",
            self.max_rdqi,
            masked,
            tile.source.display()
        );
        (tile, Some(mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, RegionSpec};
    use ndarray::array;
    use std::path::PathBuf;

    fn tile_with_qa(qa: Option<Array2<u8>>) -> RasterTile {
        RasterTile {
            data: array![[10.0f32, 20.0], [30.0, f32::NAN]],
            qa,
            region: RegionSpec {
                bbox: BoundingBox {
                    min_lat: 0.0,
                    max_lat: 1.0,
                    min_lon: 0.0,
                    max_lon: 1.0,
                },
                resolution: 0.5,
                rows: 2,
                cols: 2,
            },
            band_name: "red_radiance".to_string(),
            units: None,
            source: PathBuf::from("test.nc"),
        }
    }

    #[test]
    fn test_masks_pixels_above_threshold() {
        let filter = QaFilter::new(true, 1);
        let qa = array![[0u8, 2], [1, 3]];
        let (tile, mask) = filter.apply(tile_with_qa(Some(qa)));

        let mask = mask.unwrap();
        assert!(mask[[0, 0]] && mask[[1, 0]]);
        assert!(!mask[[0, 1]] && !mask[[1, 1]]);
        assert_eq!(tile.data[[0, 0]], 10.0);
        assert!(tile.data[[0, 1]].is_nan());
        assert_eq!(tile.data[[1, 0]], 30.0);
        assert!(tile.qa.is_none(), "RDQI plane must be consumed");
    }

    #[test]
    fn test_identity_when_disabled() {
        let filter = QaFilter::new(false, 1);
        let qa = array![[3u8, 3], [3, 3]];
        let (tile, mask) = filter.apply(tile_with_qa(Some(qa)));

        assert!(mask.is_none());
        assert_eq!(tile.data[[0, 0]], 10.0);
        assert_eq!(tile.data[[0, 1]], 20.0);
    }

    #[test]
    fn test_identity_without_qa_plane() {
        let filter = QaFilter::new(true, 1);
        let (tile, mask) = filter.apply(tile_with_qa(None));

        assert!(mask.is_none());
        assert_eq!(tile.data[[1, 0]], 30.0);
    }

    #[test]
    fn test_deterministic_for_identical_input() {
        let filter = QaFilter::new(true, 0);
        let qa = array![[0u8, 1], [2, 3]];
        let (a, _) = filter.apply(tile_with_qa(Some(qa.clone())));
        let (b, _) = filter.apply(tile_with_qa(Some(qa)));

        for (x, y) in a.data.iter().zip(b.data.iter()) {
            assert_eq!(x.is_nan(), y.is_nan());
            if x.is_finite() {
                assert_eq!(x, y);
            }
        }
    }
}
