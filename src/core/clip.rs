use crate::types::{BoundingBox, MisrError, MisrResult, RasterTile, RegionSpec};
use gdal::vector::LayerAccess;
use gdal::Dataset;
use ndarray::{Array2, Zip};
use std::path::Path;

/// A geodetic polygon: exterior ring plus optional holes, vertices as
/// (lon, lat)
#[derive(Debug, Clone)]
pub struct Polygon {
    pub exterior: Vec<(f64, f64)>,
    pub holes: Vec<Vec<(f64, f64)>>,
}

/// Clip geometry loaded once per batch and shared read-only
#[derive(Debug, Clone)]
pub struct ClipGeometry {
    polygons: Vec<Polygon>,
}

impl ClipGeometry {
    pub fn from_polygons(polygons: Vec<Polygon>) -> MisrResult<Self> {
        if polygons.is_empty() {
            return Err(MisrError::Config(
                "clip geometry contains no polygons".to_string(),
            ));
        }
        Ok(Self { polygons })
    }

    /// Load polygons from any GDAL vector source (shapefile, GeoJSON, ...)
    pub fn from_vector_file<P: AsRef<Path>>(path: P) -> MisrResult<Self> {
        let path = path.as_ref();
        log::info!("Loading clip geometry from {}", path.display());

        let dataset = Dataset::open(path)?;
        let mut polygons = Vec::new();

        for mut layer in dataset.layers() {
            for feature in layer.features() {
                if let Some(geometry) = feature.geometry() {
                    collect_polygons(geometry, &mut polygons);
                }
            }
        }

        log::info!("Loaded {} clip polygons", polygons.len());
        Self::from_polygons(polygons)
    }

    pub fn polygon_count(&self) -> usize {
        self.polygons.len()
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let mut bbox = BoundingBox {
            min_lon: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
            min_lat: f64::INFINITY,
            max_lat: f64::NEG_INFINITY,
        };
        for polygon in &self.polygons {
            for &(lon, lat) in &polygon.exterior {
                bbox.min_lon = bbox.min_lon.min(lon);
                bbox.max_lon = bbox.max_lon.max(lon);
                bbox.min_lat = bbox.min_lat.min(lat);
                bbox.max_lat = bbox.max_lat.max(lat);
            }
        }
        bbox
    }

    /// Even-odd containment test over all rings (holes subtract)
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        let mut crossings = 0usize;
        for polygon in &self.polygons {
            crossings += ring_crossings(&polygon.exterior, lon, lat);
            for hole in &polygon.holes {
                crossings += ring_crossings(hole, lon, lat);
            }
        }
        crossings % 2 == 1
    }
}

fn collect_polygons(geometry: &gdal::vector::Geometry, out: &mut Vec<Polygon>) {
    match geometry.geometry_name().to_uppercase().as_str() {
        "POLYGON" => {
            let ring_count = geometry.geometry_count();
            if ring_count == 0 {
                return;
            }
            let mut rings = Vec::with_capacity(ring_count);
            for i in 0..ring_count {
                let ring = geometry.get_geometry(i);
                let points: Vec<(f64, f64)> = ring
                    .get_point_vec()
                    .into_iter()
                    .map(|(x, y, _z)| (x, y))
                    .collect();
                rings.push(points);
            }
            let exterior = rings.remove(0);
            out.push(Polygon {
                exterior,
                holes: rings,
            });
        }
        "MULTIPOLYGON" | "GEOMETRYCOLLECTION" => {
            for i in 0..geometry.geometry_count() {
                let sub = geometry.get_geometry(i);
                collect_polygons(&sub, out);
            }
        }
        other => {
            log::debug!("Ignoring non-polygon clip geometry: {}", other);
        }
    }
}

/// Ray-cast crossing count for one ring
fn ring_crossings(ring: &[(f64, f64)], x: f64, y: f64) -> usize {
    let n = ring.len();
    if n < 3 {
        return 0;
    }
    let mut crossings = 0usize;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > y) != (yj > y) {
            let x_cross = xi + (y - yi) / (yj - yi) * (xj - xi);
            if x < x_cross {
                crossings += 1;
            }
        }
        j = i;
    }
    crossings
}

/// Applies a polygon clip to region-aligned tiles
///
/// The geometry is rasterized onto the target grid once per batch; every
/// tile reuses the cached mask.
pub struct ClipEngine {
    mask: Option<Array2<bool>>,
}

impl ClipEngine {
    /// No-op engine for batches with clipping disabled
    pub fn disabled() -> Self {
        Self { mask: None }
    }

    /// Rasterize the geometry onto the target grid
    ///
    /// When the geometry does not intersect the region at all the engine
    /// degrades to a no-op with a warning, matching how a mismatched
    /// shapefile is treated rather than blanking entire outputs.
    pub fn new(geometry: &ClipGeometry, region: &RegionSpec) -> Self {
        let geom_bbox = geometry.bounding_box();
        let region_bbox = &region.bbox;
        let overlaps = geom_bbox.min_lon <= region_bbox.max_lon
            && geom_bbox.max_lon >= region_bbox.min_lon
            && geom_bbox.min_lat <= region_bbox.max_lat
            && geom_bbox.max_lat >= region_bbox.min_lat;
        if !overlaps {
            log::warn!("Clip geometry does not overlap the target region, skipping clipping");
            return Self::disabled();
        }

        let mut mask = Array2::from_elem(region.shape(), false);
        Zip::indexed(&mut mask).par_for_each(|(row, col), inside| {
            let (lat, lon) = region.cell_center(row, col);
            *inside = geometry.contains(lat, lon);
        });

        let kept = mask.iter().filter(|&&m| m).count();
        log::info!(
            "Rasterized clip mask: {}/{} cells inside geometry",
            kept,
            mask.len()
        );
        Self { mask: Some(mask) }
    }

    pub fn is_enabled(&self) -> bool {
        self.mask.is_some()
    }

    /// Set pixels whose cell center falls outside the geometry to nodata
    pub fn clip(&self, mut tile: RasterTile) -> RasterTile {
        let Some(mask) = &self.mask else {
            return tile;
        };

        let mut clipped = 0usize;
        Zip::from(&mut tile.data).and(mask).for_each(|v, &inside| {
            if !inside && v.is_finite() {
                *v = f32::NAN;
                clipped += 1;
            }
        });
        log::debug!("Clipped {} pixels outside geometry", clipped);
        tile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use ndarray::Array2;
    use std::path::PathBuf;

    fn unit_region() -> RegionSpec {
        RegionSpec {
            bbox: BoundingBox {
                min_lat: 0.0,
                max_lat: 1.0,
                min_lon: 0.0,
                max_lon: 1.0,
            },
            resolution: 0.25,
            rows: 4,
            cols: 4,
        }
    }

    fn tile(region: &RegionSpec) -> RasterTile {
        RasterTile {
            data: Array2::from_elem(region.shape(), 5.0f32),
            qa: None,
            region: region.clone(),
            band_name: "red_radiance".to_string(),
            units: None,
            source: PathBuf::from("test.nc"),
        }
    }

    fn square(min: f64, max: f64) -> Vec<(f64, f64)> {
        vec![(min, min), (max, min), (max, max), (min, max), (min, min)]
    }

    #[test]
    fn test_inside_unchanged_outside_nodata() {
        let region = unit_region();
        // Covers the western half of the region
        let geometry = ClipGeometry::from_polygons(vec![Polygon {
            exterior: vec![(0.0, 0.0), (0.5, 0.0), (0.5, 1.0), (0.0, 1.0), (0.0, 0.0)],
            holes: vec![],
        }])
        .unwrap();
        let engine = ClipEngine::new(&geometry, &region);
        let clipped = engine.clip(tile(&region));

        for row in 0..4 {
            for col in 0..4 {
                let (lat, lon) = region.cell_center(row, col);
                if geometry.contains(lat, lon) {
                    assert_eq!(clipped.data[[row, col]], 5.0);
                } else {
                    assert!(clipped.data[[row, col]].is_nan());
                }
            }
        }
        // Western columns are inside, eastern outside
        assert_eq!(clipped.data[[0, 0]], 5.0);
        assert!(clipped.data[[0, 3]].is_nan());
    }

    #[test]
    fn test_holes_subtract() {
        let geometry = ClipGeometry::from_polygons(vec![Polygon {
            exterior: square(0.0, 1.0),
            holes: vec![square(0.4, 0.6)],
        }])
        .unwrap();

        assert!(geometry.contains(0.2, 0.2));
        assert!(!geometry.contains(0.5, 0.5));
        assert!(!geometry.contains(1.5, 1.5));
    }

    #[test]
    fn test_non_overlapping_geometry_degrades_to_noop() {
        let region = unit_region();
        let geometry = ClipGeometry::from_polygons(vec![Polygon {
            exterior: square(10.0, 11.0),
            holes: vec![],
        }])
        .unwrap();
        let engine = ClipEngine::new(&geometry, &region);

        assert!(!engine.is_enabled());
        let clipped = engine.clip(tile(&region));
        assert!(clipped.data.iter().all(|v| *v == 5.0));
    }

    #[test]
    fn test_disabled_engine_is_identity() {
        let region = unit_region();
        let engine = ClipEngine::disabled();
        let clipped = engine.clip(tile(&region));
        assert!(clipped.data.iter().all(|v| *v == 5.0));
    }

    #[test]
    fn test_empty_geometry_rejected() {
        assert!(matches!(
            ClipGeometry::from_polygons(vec![]),
            Err(MisrError::Config(_))
        ));
    }
}
