use crate::types::{GranuleFormat, MisrError, MisrResult, QaGrid, RasterGrid, SourceGranule};
use gdal::Dataset;
use ndarray::Array2;
use std::path::Path;

/// Packed Radiance/RDQI fill word
pub const RDQI_FILL_VALUE: u16 = 65515;
/// Radiance DN occupies bits 0-13 of the packed word
pub const RDQI_RADIANCE_MASK: u16 = 0x3FFF;
/// RDQI occupies bits 14-15
pub const RDQI_QUALITY_SHIFT: u16 = 14;

/// NetCDF group holding the coarse per-pixel geolocation
const GEOMETRY_GROUP: &str = "GeometricParameters";

/// Detect the processing backend for a file from its extension
pub fn detect_format<P: AsRef<Path>>(path: P) -> MisrResult<GranuleFormat> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "nc" | "nc4" => Ok(GranuleFormat::InProcess),
        "hdf" | "he5" => Ok(GranuleFormat::ToolkitOnly),
        _ => Err(MisrError::UnsupportedFormat(format!(
            "unrecognized granule extension '{}' for {}",
            ext,
            path.display()
        ))),
    }
}

/// Map a toolkit field name (e.g. "Red Radiance/RDQI") to its NetCDF group
pub fn netcdf_group_for_field(field_name: &str) -> MisrResult<String> {
    let color = field_name.split_whitespace().next().unwrap_or_default();
    match color {
        "Red" | "Green" | "Blue" | "NIR" => Ok(format!("Radiance_275_m/{}_Band", color)),
        _ => Err(MisrError::UnsupportedFormat(format!(
            "no band mapping for field '{}'",
            field_name
        ))),
    }
}

/// Short band tag for output filenames ("red", "nir", ...)
pub fn band_tag(field_name: &str) -> String {
    field_name
        .split_whitespace()
        .next()
        .unwrap_or("band")
        .to_lowercase()
}

impl SourceGranule {
    /// Build a granule reference, resolving its backend format once
    pub fn from_path<P: AsRef<Path>>(path: P) -> MisrResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(MisrError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("granule not found: {}", path.display()),
            )));
        }
        let format = detect_format(path)?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "granule".to_string());

        Ok(SourceGranule {
            path: path.to_path_buf(),
            format,
            stem,
        })
    }
}

/// Shape and size metadata gathered during pre-flight validation
#[derive(Debug, Clone)]
pub struct GranuleMetadata {
    pub file_size_mb: f64,
    pub data_shape: (usize, usize),
    pub geometry_shape: (usize, usize),
}

/// Reader for NetCDF-class MISR granules
///
/// Radiance lives in `Radiance_275_m/<Band>_Band/Radiance` as packed
/// 16-bit Radiance/RDQI words; geolocation lives in `GeometricParameters`
/// at a coarser grid and is expanded to the radiance shape on read.
pub struct GranuleReader<'a> {
    granule: &'a SourceGranule,
}

impl<'a> GranuleReader<'a> {
    pub fn open(granule: &'a SourceGranule) -> MisrResult<Self> {
        if granule.format != GranuleFormat::InProcess {
            return Err(MisrError::UnsupportedFormat(format!(
                "{} is not a NetCDF-class granule",
                granule.path.display()
            )));
        }
        Ok(Self { granule })
    }

    /// GDAL subdataset path for a group/variable pair
    fn subdataset(&self, group: &str, variable: &str) -> String {
        format!(
            "NETCDF:\"{}\":/{}/{}",
            self.granule.path.display(),
            group,
            variable
        )
    }

    fn open_subdataset(&self, group: &str, variable: &str) -> MisrResult<Dataset> {
        let name = self.subdataset(group, variable);
        Dataset::open(Path::new(&name)).map_err(|e| {
            MisrError::UnsupportedFormat(format!(
                "cannot open {}/{} in {}: {}",
                group,
                variable,
                self.granule.path.display(),
                e
            ))
        })
    }

    /// Read the packed Radiance/RDQI words for the configured field
    pub fn read_packed_field(&self, field_name: &str) -> MisrResult<Array2<u16>> {
        let group = netcdf_group_for_field(field_name)?;
        let dataset = self.open_subdataset(&group, "Radiance")?;
        let (width, height) = dataset.raster_size();
        log::debug!(
            "Reading {}x{} packed words from {}/Radiance",
            height,
            width,
            group
        );

        let rasterband = dataset.rasterband(1)?;
        let band_data = rasterband.read_as::<u16>((0, 0), (width, height), (width, height), None)?;

        Array2::from_shape_vec((height, width), band_data.data)
            .map_err(|e| MisrError::Processing(format!("failed to reshape radiance data: {}", e)))
    }

    /// Read the coarse geolocation grids (latitude, longitude)
    pub fn read_geolocation(&self) -> MisrResult<(Array2<f64>, Array2<f64>)> {
        let lat = self.read_geometry_variable("Latitude")?;
        let lon = self.read_geometry_variable("Longitude")?;
        if lat.dim() != lon.dim() {
            return Err(MisrError::GeometryMismatch(format!(
                "latitude grid {:?} does not match longitude grid {:?}",
                lat.dim(),
                lon.dim()
            )));
        }
        Ok((lat, lon))
    }

    fn read_geometry_variable(&self, variable: &str) -> MisrResult<Array2<f64>> {
        let name = self.subdataset(GEOMETRY_GROUP, variable);
        let dataset = Dataset::open(Path::new(&name)).map_err(|e| {
            MisrError::GeometryMismatch(format!(
                "geolocation variable {} missing from {}: {}",
                variable,
                self.granule.path.display(),
                e
            ))
        })?;

        let (width, height) = dataset.raster_size();
        let rasterband = dataset.rasterband(1)?;
        let band_data = rasterband.read_as::<f64>((0, 0), (width, height), (width, height), None)?;

        Array2::from_shape_vec((height, width), band_data.data).map_err(|e| {
            MisrError::GeometryMismatch(format!("failed to reshape {} grid: {}", variable, e))
        })
    }

    /// Pre-flight validation: required subdatasets present and readable
    pub fn validate(&self, field_name: &str) -> MisrResult<GranuleMetadata> {
        let group = netcdf_group_for_field(field_name)?;
        let data_ds = self.open_subdataset(&group, "Radiance")?;
        let (dw, dh) = data_ds.raster_size();

        let (lat, _lon) = self.read_geolocation()?;
        let (gh, gw) = lat.dim();

        let file_size_mb = std::fs::metadata(&self.granule.path)
            .map(|m| m.len() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0);

        log::info!(
            "Validated {}: data {}x{}, geometry {}x{}, {:.1} MB",
            self.granule.file_name(),
            dh,
            dw,
            gh,
            gw,
            file_size_mb
        );

        Ok(GranuleMetadata {
            file_size_mb,
            data_shape: (dh, dw),
            geometry_shape: (gh, gw),
        })
    }
}

/// Unpack Radiance/RDQI words into a radiance DN plane and an RDQI plane
///
/// Fill words become NaN radiance with RDQI 3.
pub fn unpack_rdqi(packed: &Array2<u16>) -> (RasterGrid, QaGrid) {
    let radiance = packed.mapv(|word| {
        if word == RDQI_FILL_VALUE {
            f32::NAN
        } else {
            (word & RDQI_RADIANCE_MASK) as f32
        }
    });
    let rdqi = packed.mapv(|word| {
        if word == RDQI_FILL_VALUE {
            3u8
        } else {
            (word >> RDQI_QUALITY_SHIFT) as u8
        }
    });
    (radiance, rdqi)
}

/// Bilinearly expand a coarse geolocation grid to the radiance shape
///
/// MISR ships 275 m radiance against a much coarser geometry grid (nominal
/// factor 64); per-pixel coordinates are interpolated between the coarse
/// samples.
pub fn expand_geolocation(
    coarse: &Array2<f64>,
    fine_shape: (usize, usize),
) -> MisrResult<Array2<f64>> {
    let (ch, cw) = coarse.dim();
    let (fh, fw) = fine_shape;
    if ch == 0 || cw == 0 || fh == 0 || fw == 0 {
        return Err(MisrError::GeometryMismatch(
            "empty geolocation or data grid".to_string(),
        ));
    }
    if (ch, cw) == (fh, fw) {
        return Ok(coarse.clone());
    }

    let row_scale = if fh > 1 {
        (ch - 1) as f64 / (fh - 1) as f64
    } else {
        0.0
    };
    let col_scale = if fw > 1 {
        (cw - 1) as f64 / (fw - 1) as f64
    } else {
        0.0
    };

    let mut fine = Array2::zeros((fh, fw));
    for i in 0..fh {
        let y = i as f64 * row_scale;
        let y0 = (y.floor() as usize).min(ch - 1);
        let y1 = (y0 + 1).min(ch - 1);
        let fy = y - y0 as f64;
        for j in 0..fw {
            let x = j as f64 * col_scale;
            let x0 = (x.floor() as usize).min(cw - 1);
            let x1 = (x0 + 1).min(cw - 1);
            let fx = x - x0 as f64;

            let top = coarse[[y0, x0]] * (1.0 - fx) + coarse[[y0, x1]] * fx;
            let bottom = coarse[[y1, x0]] * (1.0 - fx) + coarse[[y1, x1]] * fx;
            fine[[i, j]] = top * (1.0 - fy) + bottom * fy;
        }
    }
    Ok(fine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format("a/b/granule.nc").unwrap(), GranuleFormat::InProcess);
        assert_eq!(detect_format("granule.NC4").unwrap(), GranuleFormat::InProcess);
        assert_eq!(detect_format("granule.hdf").unwrap(), GranuleFormat::ToolkitOnly);
        assert_eq!(detect_format("granule.he5").unwrap(), GranuleFormat::ToolkitOnly);
        assert!(matches!(
            detect_format("granule.txt"),
            Err(MisrError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_source_granule_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("MISR_AM1_GRP_ELLIPSOID_GM_P043_O120540_AN.nc");
        std::fs::write(&path, b"").unwrap();

        let granule = SourceGranule::from_path(&path).unwrap();
        assert_eq!(granule.format, GranuleFormat::InProcess);
        assert_eq!(granule.stem, "MISR_AM1_GRP_ELLIPSOID_GM_P043_O120540_AN");

        let missing = SourceGranule::from_path(dir.path().join("missing.nc"));
        assert!(matches!(missing, Err(MisrError::Io(_))));
    }

    #[test]
    fn test_field_mapping() {
        assert_eq!(
            netcdf_group_for_field("Red Radiance/RDQI").unwrap(),
            "Radiance_275_m/Red_Band"
        );
        assert_eq!(
            netcdf_group_for_field("NIR Radiance/RDQI").unwrap(),
            "Radiance_275_m/NIR_Band"
        );
        assert!(netcdf_group_for_field("Cloud Mask").is_err());
        assert_eq!(band_tag("Red Radiance/RDQI"), "red");
    }

    #[test]
    fn test_unpack_rdqi() {
        // DN 100 with RDQI 0, DN 200 with RDQI 1, DN 5 with RDQI 3, fill
        let packed = array![[100u16, (1 << 14) | 200, (3 << 14) | 5, RDQI_FILL_VALUE]];
        let (radiance, rdqi) = unpack_rdqi(&packed);

        assert_relative_eq!(radiance[[0, 0]], 100.0);
        assert_relative_eq!(radiance[[0, 1]], 200.0);
        assert_relative_eq!(radiance[[0, 2]], 5.0);
        assert!(radiance[[0, 3]].is_nan());
        assert_eq!(rdqi[[0, 0]], 0);
        assert_eq!(rdqi[[0, 1]], 1);
        assert_eq!(rdqi[[0, 2]], 3);
        assert_eq!(rdqi[[0, 3]], 3);
    }

    #[test]
    fn test_expand_geolocation_corners_preserved() {
        let coarse = array![[50.0, 51.0], [52.0, 53.0]];
        let fine = expand_geolocation(&coarse, (5, 5)).unwrap();

        assert_eq!(fine.dim(), (5, 5));
        assert_relative_eq!(fine[[0, 0]], 50.0);
        assert_relative_eq!(fine[[0, 4]], 51.0);
        assert_relative_eq!(fine[[4, 0]], 52.0);
        assert_relative_eq!(fine[[4, 4]], 53.0);
        // center is the bilinear midpoint
        assert_relative_eq!(fine[[2, 2]], 51.5);
    }

    #[test]
    fn test_expand_geolocation_identity_when_same_shape() {
        let coarse = array![[1.0, 2.0], [3.0, 4.0]];
        let fine = expand_geolocation(&coarse, (2, 2)).unwrap();
        assert_eq!(fine, coarse);
    }
}
