use crate::io::granule::{band_tag, expand_geolocation, unpack_rdqi, GranuleReader};
use crate::types::{
    MisrError, MisrResult, QaGrid, RasterGrid, RasterTile, RegionSpec, SourceGranule,
};
use ndarray::Array2;

/// Per-plane resampling strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resampling {
    /// Value of the source pixel nearest to the cell center; used for
    /// categorical planes (RDQI)
    Nearest,
    /// Mean of all source pixels falling in the cell; used for continuous
    /// radiance
    Average,
}

/// In-process reprojection backend for NetCDF-class granules
///
/// Stateless per call: reads packed radiance and per-pixel geolocation,
/// unpacks DN/RDQI, and bins source pixels onto the shared target grid.
pub struct ReprojectionEngine {
    field_name: String,
    /// Attach the resampled RDQI plane to produced tiles
    carry_qa: bool,
}

impl ReprojectionEngine {
    pub fn new(field_name: impl Into<String>, carry_qa: bool) -> Self {
        Self {
            field_name: field_name.into(),
            carry_qa,
        }
    }

    /// Reproject one granule onto the target grid
    pub fn reproject(
        &self,
        granule: &SourceGranule,
        region: &RegionSpec,
    ) -> MisrResult<RasterTile> {
        log::info!("Reprojecting {} in-process", granule.file_name());

        let reader = GranuleReader::open(granule)?;
        let packed = reader.read_packed_field(&self.field_name)?;
        let (radiance, rdqi) = unpack_rdqi(&packed);

        let (lat_coarse, lon_coarse) = reader.read_geolocation()?;
        let lat = expand_geolocation(&lat_coarse, radiance.dim())?;
        let lon = expand_geolocation(&lon_coarse, radiance.dim())?;

        if !lat.iter().any(|v| v.is_finite()) {
            return Err(MisrError::GeometryMismatch(format!(
                "geolocation arrays in {} contain no finite coordinates",
                granule.file_name()
            )));
        }

        let (data, contributors) =
            resample_to_grid(&radiance, &lat, &lon, region, Resampling::Average)?;
        if contributors == 0 {
            return Err(MisrError::Processing(format!(
                "no source data from {} overlaps the target region",
                granule.file_name()
            )));
        }
        log::debug!(
            "{} source pixels binned onto {}x{} grid",
            contributors,
            region.rows,
            region.cols
        );

        let qa = if self.carry_qa {
            Some(resample_qa(&rdqi, &lat, &lon, region)?)
        } else {
            None
        };

        Ok(RasterTile {
            data,
            qa,
            region: region.clone(),
            band_name: format!("{}_radiance", band_tag(&self.field_name)),
            units: Some("W/m²/sr/μm".to_string()),
            source: granule.path.clone(),
        })
    }
}

/// Bin scattered source pixels onto the target grid
///
/// Returns the filled grid and the number of in-region source pixels;
/// cells no source pixel maps to stay NaN.
pub fn resample_to_grid(
    values: &RasterGrid,
    lats: &Array2<f64>,
    lons: &Array2<f64>,
    region: &RegionSpec,
    method: Resampling,
) -> MisrResult<(RasterGrid, usize)> {
    if values.dim() != lats.dim() || values.dim() != lons.dim() {
        return Err(MisrError::GeometryMismatch(format!(
            "data shape {:?} does not match geolocation shape {:?}",
            values.dim(),
            lats.dim()
        )));
    }

    let (rows, cols) = region.shape();
    let mut contributors = 0usize;

    let grid = match method {
        Resampling::Average => {
            let mut sum = Array2::<f64>::zeros((rows, cols));
            let mut count = Array2::<u32>::zeros((rows, cols));

            for ((v, &lat), &lon) in values.iter().zip(lats.iter()).zip(lons.iter()) {
                if !v.is_finite() || !lat.is_finite() || !lon.is_finite() {
                    continue;
                }
                let Some((row, col)) = target_cell(region, lat, lon, rows, cols) else {
                    continue;
                };
                sum[[row, col]] += *v as f64;
                count[[row, col]] += 1;
                contributors += 1;
            }

            let mut grid = Array2::from_elem((rows, cols), f32::NAN);
            for ((out, &s), &n) in grid.iter_mut().zip(sum.iter()).zip(count.iter()) {
                if n > 0 {
                    *out = (s / n as f64) as f32;
                }
            }
            grid
        }
        Resampling::Nearest => {
            let mut grid = Array2::from_elem((rows, cols), f32::NAN);
            let mut best = Array2::from_elem((rows, cols), f64::INFINITY);

            for ((v, &lat), &lon) in values.iter().zip(lats.iter()).zip(lons.iter()) {
                if !v.is_finite() || !lat.is_finite() || !lon.is_finite() {
                    continue;
                }
                let Some((row, col)) = target_cell(region, lat, lon, rows, cols) else {
                    continue;
                };
                let (clat, clon) = region.cell_center(row, col);
                let dist = (lat - clat).powi(2) + (lon - clon).powi(2);
                if dist < best[[row, col]] {
                    best[[row, col]] = dist;
                    grid[[row, col]] = *v;
                }
                contributors += 1;
            }
            grid
        }
    };

    Ok((grid, contributors))
}

/// Nearest-neighbor resample of the RDQI plane; cells without a source
/// pixel get RDQI 3 (unusable)
fn resample_qa(
    rdqi: &QaGrid,
    lats: &Array2<f64>,
    lons: &Array2<f64>,
    region: &RegionSpec,
) -> MisrResult<QaGrid> {
    let as_f32 = rdqi.mapv(|q| q as f32);
    let (grid, _) = resample_to_grid(&as_f32, lats, lons, region, Resampling::Nearest)?;
    Ok(grid.mapv(|v| if v.is_finite() { v as u8 } else { 3u8 }))
}

fn target_cell(
    region: &RegionSpec,
    lat: f64,
    lon: f64,
    rows: usize,
    cols: usize,
) -> Option<(usize, usize)> {
    if !region.bbox.contains(lat, lon) {
        return None;
    }
    // Boundary pixels on the southern/eastern edge clamp into the last cell
    let row = ((region.bbox.max_lat - lat) / region.resolution) as usize;
    let col = ((lon - region.bbox.min_lon) / region.resolution) as usize;
    Some((row.min(rows - 1), col.min(cols - 1)))
}
